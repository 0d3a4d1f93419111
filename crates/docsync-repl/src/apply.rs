//! Transactional apply handlers.
//!
//! Every handler locks the collections it touches, begins a transaction,
//! checks preconditions and then either commits its staged mutations or
//! aborts. A missing source or destination means the target already
//! converged: the handler logs a warning and returns
//! [`ApplyOutcome::Converged`]. Store failures abort and become
//! [`ReplError::Apply`].

use bytes::Bytes;
use docsync_store::{
    DocPath, MimeTable, MimeType, Permission, ResourceKind, SecurityManager, Store, StoreError,
    Txn,
};
use docsync_store::store::{DEFAULT_COLLECTION_MODE, DEFAULT_RESOURCE_MODE};
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::dispatch::Handler;
use crate::envelope::{keys, Envelope};
use crate::error::{ReplError, Result};

/// Why a handler changed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The collection holding the source does not exist.
    SourceCollectionMissing,
    /// The source document does not exist.
    SourceDocumentMissing,
    /// The destination's parent collection does not exist.
    DestinationCollectionMissing,
    /// The collection to create already exists.
    CollectionExists,
}

/// Result of a handler that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Mutations committed.
    Applied,
    /// Nothing to do; the target state already holds.
    Converged(SkipReason),
}

struct Ownership {
    owner: String,
    group: String,
    mode: Option<u32>,
}

/// Applies envelopes to a store.
#[derive(Clone)]
pub struct Applier {
    store: Arc<dyn Store>,
    security: Arc<dyn SecurityManager>,
    mime: Arc<MimeTable>,
}

impl std::fmt::Debug for Applier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applier")
            .field("root", &self.store.root())
            .finish()
    }
}

fn parent_of(path: &DocPath, origin: &str) -> Result<DocPath> {
    path.parent().ok_or_else(|| ReplError::Apply {
        origin: origin.to_string(),
        msg: format!("{} has no parent collection", path),
        source: None,
    })
}

fn destination_of<'a>(envelope: &'a Envelope, origin: &str) -> Result<&'a DocPath> {
    envelope
        .destination_path
        .as_ref()
        .ok_or_else(|| ReplError::Apply {
            origin: origin.to_string(),
            msg: format!("{} has no destination path", envelope.source_path),
            source: None,
        })
}

impl Applier {
    /// An applier over `store`, resolving principals with `security` and mime
    /// types with `mime`.
    pub fn new(store: Arc<dyn Store>, security: Arc<dyn SecurityManager>, mime: MimeTable) -> Self {
        Self {
            store,
            security,
            mime: Arc::new(mime),
        }
    }

    /// The target store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run `handler` for `envelope`.
    pub fn apply(&self, handler: Handler, envelope: &Envelope) -> Result<ApplyOutcome> {
        let origin = handler.name();
        debug!(handler = origin, envelope = %envelope.summary(), "applying");
        match handler {
            Handler::StoreDocument => self.store_document(envelope, origin),
            Handler::UpdateDocumentMetadata => self.update_document_metadata(envelope, origin),
            Handler::DeleteDocument => self.delete_document(envelope, origin),
            Handler::RelocateDocument { copy } => self.relocate_document(envelope, copy, origin),
            Handler::CreateCollection => self.create_collection(envelope, origin),
            Handler::DeleteCollection => self.delete_collection(envelope, origin),
            Handler::RelocateCollection { copy } => {
                self.relocate_collection(envelope, copy, origin)
            }
        }
    }

    fn skip(&self, txn: Txn, reason: SkipReason, path: &DocPath) -> Result<ApplyOutcome> {
        warn!(txn = %txn.id(), origin = txn.origin(), path = %path, ?reason, "nothing to apply");
        self.store.abort(txn);
        Ok(ApplyOutcome::Converged(reason))
    }

    fn commit(&self, txn: Txn) -> Result<ApplyOutcome> {
        let origin = txn.origin().to_string();
        self.store
            .commit(txn)
            .map_err(|e| ReplError::apply(&origin, e))?;
        Ok(ApplyOutcome::Applied)
    }

    fn fail(&self, txn: Txn, err: ReplError) -> ReplError {
        error!(txn = %txn.id(), origin = txn.origin(), error = %err, "apply failed, transaction aborted");
        self.store.abort(txn);
        err
    }

    fn resolve_ownership(&self, envelope: &Envelope) -> Ownership {
        let owner = match envelope.owner().and_then(|name| self.security.account(name)) {
            Some(account) => account.name,
            None => {
                let system = self.security.system_subject();
                warn!(requested = ?envelope.owner(), fallback = %system.name, "owner does not resolve");
                system.name
            }
        };
        let group = match envelope.group().and_then(|name| self.security.group(name)) {
            Some(group) => group.name,
            None => {
                let system = self.security.system_subject();
                warn!(requested = ?envelope.group(), fallback = %system.default_group, "group does not resolve");
                system.default_group
            }
        };
        Ownership {
            owner,
            group,
            mode: envelope.mode(),
        }
    }

    fn resolve_mime(&self, envelope: &Envelope, origin: &str) -> Result<MimeType> {
        let declared = envelope
            .mime_type()
            .or_else(|| envelope.properties.get_str(keys::DOCUMENT_MIMETYPE));
        if let Some(name) = declared {
            if let Some(mime) = self
                .mime
                .for_name(name)
                .or_else(|| self.mime.content_type_for(name))
            {
                return Ok(mime.clone());
            }
        }
        self.mime
            .content_type_for(envelope.source_path.name())
            .cloned()
            .ok_or_else(|| ReplError::Apply {
                origin: origin.to_string(),
                msg: format!("unable to determine mime type of {}", envelope.source_path),
                source: None,
            })
    }

    /// Decompress the payload, validating structured content in a first pass.
    fn read_content(&self, envelope: &Envelope, kind: ResourceKind, origin: &str) -> Result<Bytes> {
        let path = &envelope.source_path;
        if kind == ResourceKind::Xml {
            let mut reader = envelope.content_reader()?;
            self.store
                .validate_xml(path, &mut reader)
                .map_err(|e| ReplError::apply(origin, e))?;
        }
        let mut reader = envelope.content_reader()?;
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .map_err(|e| ReplError::apply(origin, StoreError::Io(e)))?;
        Ok(Bytes::from(content))
    }

    fn create_missing_parent(&self, parent: &DocPath, ownership: &Ownership, origin: &str) -> Result<()> {
        warn!(collection = %parent, "collection does not exist, creating it");
        let mut txn = self.store.begin(origin);
        txn.create_collection(
            parent.clone(),
            Permission::collection_default(&ownership.owner, &ownership.group),
        );
        match self.store.commit(txn) {
            Ok(()) | Err(StoreError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(ReplError::apply(origin, e)),
        }
    }

    fn store_document(&self, envelope: &Envelope, origin: &str) -> Result<ApplyOutcome> {
        let path = &envelope.source_path;
        let parent = parent_of(path, origin)?;
        let ownership = self.resolve_ownership(envelope);
        let mime = self.resolve_mime(envelope, origin)?;
        let kind = envelope.data_type().unwrap_or(mime.kind);

        let _locks = self.store.lock(std::slice::from_ref(&parent));
        if self.store.collection(&parent).is_none() {
            self.create_missing_parent(&parent, &ownership, origin)?;
        }

        let mut txn = self.store.begin(origin);
        let content = match self.read_content(envelope, kind, origin) {
            Ok(content) => content,
            Err(e) => return Err(self.fail(txn, e)),
        };
        let permission = Permission::new(
            ownership.owner,
            ownership.group,
            ownership.mode.unwrap_or(DEFAULT_RESOURCE_MODE),
        );
        match kind {
            ResourceKind::Xml => txn.store_xml(path.clone(), content, &mime.name, permission),
            ResourceKind::Binary => txn.store_binary(path.clone(), content, &mime.name, permission),
        }
        self.commit(txn)
    }

    fn update_document_metadata(&self, envelope: &Envelope, origin: &str) -> Result<ApplyOutcome> {
        let path = &envelope.source_path;
        let parent = parent_of(path, origin)?;

        let _locks = self.store.lock(std::slice::from_ref(&parent));
        let txn = self.store.begin(origin);
        if self.store.collection(&parent).is_none() {
            return self.skip(txn, SkipReason::SourceCollectionMissing, &parent);
        }
        if self.store.document(path).is_none() {
            return self.skip(txn, SkipReason::SourceDocumentMissing, path);
        }
        // Metadata fields are not replicated yet; commit the empty transaction.
        self.commit(txn)
    }

    fn delete_document(&self, envelope: &Envelope, origin: &str) -> Result<ApplyOutcome> {
        let path = &envelope.source_path;
        let parent = parent_of(path, origin)?;

        let _locks = self.store.lock(std::slice::from_ref(&parent));
        let mut txn = self.store.begin(origin);
        if self.store.collection(&parent).is_none() {
            return self.skip(txn, SkipReason::SourceCollectionMissing, &parent);
        }
        let Some(document) = self.store.document(path) else {
            return self.skip(txn, SkipReason::SourceDocumentMissing, path);
        };
        match document.kind {
            ResourceKind::Xml => txn.remove_xml(path.clone()),
            ResourceKind::Binary => txn.remove_binary(path.clone()),
        }
        self.commit(txn)
    }

    fn relocate_document(&self, envelope: &Envelope, copy: bool, origin: &str) -> Result<ApplyOutcome> {
        let source = &envelope.source_path;
        let destination = destination_of(envelope, origin)?;
        let source_parent = parent_of(source, origin)?;
        let destination_parent = parent_of(destination, origin)?;

        let _locks = self
            .store
            .lock(&[source_parent.clone(), destination_parent.clone()]);
        let mut txn = self.store.begin(origin);
        if self.store.collection(&source_parent).is_none() {
            return self.skip(txn, SkipReason::SourceCollectionMissing, &source_parent);
        }
        if self.store.document(source).is_none() {
            return self.skip(txn, SkipReason::SourceDocumentMissing, source);
        }
        if self.store.collection(&destination_parent).is_none() {
            return self.skip(txn, SkipReason::DestinationCollectionMissing, &destination_parent);
        }
        if copy {
            txn.copy_document(source.clone(), destination.clone());
        } else {
            txn.move_document(source.clone(), destination.clone());
        }
        self.commit(txn)
    }

    fn create_collection(&self, envelope: &Envelope, origin: &str) -> Result<ApplyOutcome> {
        let path = &envelope.source_path;
        let ownership = self.resolve_ownership(envelope);

        let _locks = self.store.lock(std::slice::from_ref(path));
        let mut txn = self.store.begin(origin);
        if self.store.collection(path).is_some() {
            return self.skip(txn, SkipReason::CollectionExists, path);
        }
        txn.create_collection(
            path.clone(),
            Permission::new(
                ownership.owner,
                ownership.group,
                ownership.mode.unwrap_or(DEFAULT_COLLECTION_MODE),
            ),
        );
        self.commit(txn)
    }

    fn delete_collection(&self, envelope: &Envelope, origin: &str) -> Result<ApplyOutcome> {
        let path = &envelope.source_path;

        let _locks = self.store.lock(std::slice::from_ref(path));
        let mut txn = self.store.begin(origin);
        if self.store.collection(path).is_none() {
            return self.skip(txn, SkipReason::SourceCollectionMissing, path);
        }
        txn.remove_collection(path.clone());
        self.commit(txn)
    }

    fn relocate_collection(&self, envelope: &Envelope, copy: bool, origin: &str) -> Result<ApplyOutcome> {
        let source = &envelope.source_path;
        let destination = destination_of(envelope, origin)?;
        let destination_parent = parent_of(destination, origin)?;

        let _locks = self
            .store
            .lock(&[source.clone(), destination_parent.clone()]);
        let mut txn = self.store.begin(origin);
        if self.store.collection(source).is_none() {
            return self.skip(txn, SkipReason::SourceCollectionMissing, source);
        }
        if self.store.collection(&destination_parent).is_none() {
            return self.skip(txn, SkipReason::DestinationCollectionMissing, &destination_parent);
        }
        if copy {
            txn.copy_collection(source.clone(), destination.clone());
        } else {
            txn.move_collection(source.clone(), destination.clone());
        }
        self.commit(txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Operation, ResourceType};
    use docsync_store::{MemorySecurity, MemoryStore};

    fn p(s: &str) -> DocPath {
        DocPath::parse(s).unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        security: Arc<MemorySecurity>,
        applier: Applier,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let security = Arc::new(MemorySecurity::new());
        security.add_account("alice", "editors");
        let applier = Applier::new(store.clone(), security.clone(), MimeTable::default());
        Fixture {
            store,
            security,
            applier,
        }
    }

    impl Fixture {
        fn run(&self, handler: Handler, envelope: &Envelope) -> Result<ApplyOutcome> {
            self.applier.apply(handler, envelope)
        }

        fn mkcol(&self, path: &str) {
            let env = Envelope::new(ResourceType::Collection, Operation::Create, p(path));
            self.run(Handler::CreateCollection, &env).unwrap();
        }

        fn put(&self, path: &str, content: &[u8]) {
            let env = Envelope::new(ResourceType::Document, Operation::Create, p(path))
                .compress_payload(content)
                .unwrap();
            assert_eq!(self.run(Handler::StoreDocument, &env).unwrap(), ApplyOutcome::Applied);
        }
    }

    mod store_document {
        use super::*;

        #[test]
        fn test_creates_missing_parent_with_resolved_owner() {
            let f = fixture();
            let env = Envelope::new(ResourceType::Document, Operation::Create, p("/db/new/sub/a.xml"))
                .compress_payload(b"<a>hi</a>")
                .unwrap()
                .with_owner("alice")
                .with_group("editors")
                .with_mode(0o600);
            assert_eq!(f.run(Handler::StoreDocument, &env).unwrap(), ApplyOutcome::Applied);

            let col = f.store.collection(&p("/db/new/sub")).unwrap();
            assert_eq!(col.permission.owner, "alice");
            assert_eq!(col.permission.group, "editors");
            assert_eq!(col.permission.mode, DEFAULT_COLLECTION_MODE);
            assert!(f.store.collection(&p("/db/new")).is_some());

            let doc = f.store.document(&p("/db/new/sub/a.xml")).unwrap();
            assert_eq!(doc.kind, ResourceKind::Xml);
            assert_eq!(doc.mime_type, "application/xml");
            assert_eq!(doc.permission, Permission::new("alice", "editors", 0o600));
            assert_eq!(
                f.store.read_document(&p("/db/new/sub/a.xml")).unwrap(),
                Bytes::from_static(b"<a>hi</a>")
            );
        }

        #[test]
        fn test_unknown_owner_falls_back_to_system() {
            let f = fixture();
            let env = Envelope::new(ResourceType::Document, Operation::Create, p("/db/a.txt"))
                .compress_payload(b"text")
                .unwrap()
                .with_owner("nobody")
                .with_group("ghosts");
            f.run(Handler::StoreDocument, &env).unwrap();
            let doc = f.store.document(&p("/db/a.txt")).unwrap();
            let system = f.security.system_subject();
            assert_eq!(doc.permission.owner, system.name);
            assert_eq!(doc.permission.group, system.default_group);
            assert_eq!(doc.permission.mode, DEFAULT_RESOURCE_MODE);
            assert_eq!(doc.kind, ResourceKind::Binary);
        }

        #[test]
        fn test_data_type_overrides_mime_kind() {
            let f = fixture();
            let env = Envelope::new(ResourceType::Document, Operation::Create, p("/db/raw.xml"))
                .with_payload(b"not xml at all".to_vec())
                .with_data_type(ResourceKind::Binary);
            f.run(Handler::StoreDocument, &env).unwrap();
            assert_eq!(f.store.document(&p("/db/raw.xml")).unwrap().kind, ResourceKind::Binary);
        }

        #[test]
        fn test_declared_mime_type_wins_over_extension() {
            let f = fixture();
            let env = Envelope::new(ResourceType::Document, Operation::Create, p("/db/noext"))
                .compress_payload(b"{}")
                .unwrap()
                .with_mime_type("application/json");
            f.run(Handler::StoreDocument, &env).unwrap();
            assert_eq!(f.store.document(&p("/db/noext")).unwrap().mime_type, "application/json");
        }

        #[test]
        fn test_unresolvable_mime_type_is_fatal() {
            let f = fixture();
            let env = Envelope::new(ResourceType::Document, Operation::Create, p("/db/README"))
                .compress_payload(b"x")
                .unwrap();
            let err = f.run(Handler::StoreDocument, &env).unwrap_err();
            assert!(matches!(err, ReplError::Apply { .. }));
            assert!(f.store.document(&p("/db/README")).is_none());
        }

        #[test]
        fn test_malformed_xml_aborts() {
            let f = fixture();
            let env = Envelope::new(ResourceType::Document, Operation::Create, p("/db/bad.xml"))
                .compress_payload(b"<a><b></a>")
                .unwrap();
            let aborts = f.store.abort_count();
            let err = f.run(Handler::StoreDocument, &env).unwrap_err();
            assert!(matches!(err, ReplError::Apply { source: Some(StoreError::Validation { .. }), .. }));
            assert_eq!(f.store.abort_count(), aborts + 1);
            assert!(f.store.document(&p("/db/bad.xml")).is_none());
        }

        #[test]
        fn test_corrupt_gzip_is_fatal() {
            let f = fixture();
            let mut env = Envelope::new(ResourceType::Document, Operation::Create, p("/db/a.bin"));
            env.payload = Some(Bytes::from_static(b"definitely not gzip"));
            assert!(f.run(Handler::StoreDocument, &env).is_err());
        }

        #[test]
        fn test_update_replaces_content() {
            let f = fixture();
            f.put("/db/a.xml", b"<v>1</v>");
            let id = f.store.document(&p("/db/a.xml")).unwrap().id;
            f.put("/db/a.xml", b"<v>2</v>");
            let doc = f.store.document(&p("/db/a.xml")).unwrap();
            assert_eq!(doc.id, id);
            assert_eq!(
                f.store.read_document(&p("/db/a.xml")).unwrap(),
                Bytes::from_static(b"<v>2</v>")
            );
        }

        #[test]
        fn test_locks_released_after_failure() {
            let f = fixture();
            let env = Envelope::new(ResourceType::Document, Operation::Create, p("/db/bad.xml"))
                .compress_payload(b"<unclosed>")
                .unwrap();
            assert!(f.run(Handler::StoreDocument, &env).is_err());
            assert_eq!(f.store.locks().held_count(), 0);
        }
    }

    mod delete {
        use super::*;

        #[test]
        fn test_missing_document_is_silent() {
            let f = fixture();
            let commits = f.store.commit_count();
            let env = Envelope::new(ResourceType::Document, Operation::Delete, p("/db/gone.xml"));
            assert_eq!(
                f.run(Handler::DeleteDocument, &env).unwrap(),
                ApplyOutcome::Converged(SkipReason::SourceDocumentMissing)
            );
            let env = Envelope::new(ResourceType::Document, Operation::Delete, p("/db/nocol/x.xml"));
            assert_eq!(
                f.run(Handler::DeleteDocument, &env).unwrap(),
                ApplyOutcome::Converged(SkipReason::SourceCollectionMissing)
            );
            assert_eq!(f.store.commit_count(), commits);
        }

        #[test]
        fn test_removes_by_kind() {
            let f = fixture();
            f.put("/db/a.xml", b"<a/>");
            f.put("/db/b.png", &[0x89, 0x50]);
            for path in ["/db/a.xml", "/db/b.png"] {
                let env = Envelope::new(ResourceType::Document, Operation::Delete, p(path));
                assert_eq!(f.run(Handler::DeleteDocument, &env).unwrap(), ApplyOutcome::Applied);
                assert!(f.store.document(&p(path)).is_none());
            }
        }

        #[test]
        fn test_collection_delete_is_recursive() {
            let f = fixture();
            f.put("/db/tree/a/b/c.xml", b"<c/>");
            let env = Envelope::new(ResourceType::Collection, Operation::Delete, p("/db/tree"));
            assert_eq!(f.run(Handler::DeleteCollection, &env).unwrap(), ApplyOutcome::Applied);
            assert!(f.store.collection(&p("/db/tree/a")).is_none());
            assert_eq!(f.store.document_count(), 0);

            assert_eq!(
                f.run(Handler::DeleteCollection, &env).unwrap(),
                ApplyOutcome::Converged(SkipReason::SourceCollectionMissing)
            );
        }

        #[test]
        fn test_deleting_root_is_fatal() {
            let f = fixture();
            let env = Envelope::new(ResourceType::Collection, Operation::Delete, p("/db"));
            assert!(matches!(
                f.run(Handler::DeleteCollection, &env),
                Err(ReplError::Apply { .. })
            ));
        }
    }

    mod collections {
        use super::*;

        #[test]
        fn test_create_existing_is_silent() {
            let f = fixture();
            f.mkcol("/db/a");
            let env = Envelope::new(ResourceType::Collection, Operation::Create, p("/db/a"));
            assert_eq!(
                f.run(Handler::CreateCollection, &env).unwrap(),
                ApplyOutcome::Converged(SkipReason::CollectionExists)
            );
        }

        #[test]
        fn test_create_applies_mode() {
            let f = fixture();
            let env = Envelope::new(ResourceType::Collection, Operation::Create, p("/db/private"))
                .with_owner("alice")
                .with_mode(0o700);
            f.run(Handler::CreateCollection, &env).unwrap();
            let col = f.store.collection(&p("/db/private")).unwrap();
            assert_eq!(col.permission, Permission::new("alice", "editors", 0o700));
        }

        #[test]
        fn test_create_outside_root_is_fatal() {
            let f = fixture();
            let env = Envelope::new(ResourceType::Collection, Operation::Create, p("/elsewhere/x"));
            assert!(f.run(Handler::CreateCollection, &env).is_err());
        }
    }

    mod relocate {
        use super::*;

        #[test]
        fn test_move_document_keeps_identity() {
            let f = fixture();
            f.put("/db/a/x.xml", b"<x/>");
            f.mkcol("/db/b");
            let before = f.store.document(&p("/db/a/x.xml")).unwrap();
            let env = Envelope::new(ResourceType::Document, Operation::Move, p("/db/a/x.xml"))
                .with_destination(p("/db/b/y.xml"));
            assert_eq!(
                f.run(Handler::RelocateDocument { copy: false }, &env).unwrap(),
                ApplyOutcome::Applied
            );
            let after = f.store.document(&p("/db/b/y.xml")).unwrap();
            assert_eq!(after.id, before.id);
            assert_eq!(after.permission, before.permission);
            assert!(f.store.document(&p("/db/a/x.xml")).is_none());
        }

        #[test]
        fn test_copy_document_keeps_source() {
            let f = fixture();
            f.put("/db/a/x.xml", b"<x/>");
            let env = Envelope::new(ResourceType::Document, Operation::Copy, p("/db/a/x.xml"))
                .with_destination(p("/db/a/x2.xml"));
            f.run(Handler::RelocateDocument { copy: true }, &env).unwrap();
            assert!(f.store.document(&p("/db/a/x.xml")).is_some());
            assert!(f.store.document(&p("/db/a/x2.xml")).is_some());
        }

        #[test]
        fn test_missing_destination_parent_leaves_source() {
            let f = fixture();
            f.put("/db/a/x.xml", b"<x/>");
            for copy in [false, true] {
                let env = Envelope::new(ResourceType::Document, Operation::Move, p("/db/a/x.xml"))
                    .with_destination(p("/db/missing/x.xml"));
                assert_eq!(
                    f.run(Handler::RelocateDocument { copy }, &env).unwrap(),
                    ApplyOutcome::Converged(SkipReason::DestinationCollectionMissing)
                );
                assert!(f.store.document(&p("/db/a/x.xml")).is_some());
            }
        }

        #[test]
        fn test_missing_source_is_silent() {
            let f = fixture();
            f.mkcol("/db/a");
            let env = Envelope::new(ResourceType::Document, Operation::Move, p("/db/a/none.xml"))
                .with_destination(p("/db/a/other.xml"));
            assert_eq!(
                f.run(Handler::RelocateDocument { copy: false }, &env).unwrap(),
                ApplyOutcome::Converged(SkipReason::SourceDocumentMissing)
            );
        }

        #[test]
        fn test_move_collection_subtree() {
            let f = fixture();
            f.put("/db/src/deep/d.xml", b"<d/>");
            f.mkcol("/db/dst");
            let env = Envelope::new(ResourceType::Collection, Operation::Move, p("/db/src"))
                .with_destination(p("/db/dst/moved"));
            f.run(Handler::RelocateCollection { copy: false }, &env).unwrap();
            assert!(f.store.document(&p("/db/dst/moved/deep/d.xml")).is_some());
            assert!(f.store.collection(&p("/db/src")).is_none());
        }

        #[test]
        fn test_copy_collection_missing_destination_parent() {
            let f = fixture();
            f.mkcol("/db/src");
            let env = Envelope::new(ResourceType::Collection, Operation::Copy, p("/db/src"))
                .with_destination(p("/db/nowhere/copy"));
            assert_eq!(
                f.run(Handler::RelocateCollection { copy: true }, &env).unwrap(),
                ApplyOutcome::Converged(SkipReason::DestinationCollectionMissing)
            );
            assert!(f.store.collection(&p("/db/src")).is_some());
        }

        #[test]
        fn test_move_collection_into_itself_is_fatal() {
            let f = fixture();
            f.mkcol("/db/src");
            let env = Envelope::new(ResourceType::Collection, Operation::Move, p("/db/src"))
                .with_destination(p("/db/src/inner"));
            assert!(matches!(
                f.run(Handler::RelocateCollection { copy: false }, &env),
                Err(ReplError::Apply { .. })
            ));
        }
    }

    #[test]
    fn test_metadata_update_is_empty_commit() {
        let f = fixture();
        f.put("/db/a.xml", b"<a/>");
        let commits = f.store.commit_count();
        let env = Envelope::new(ResourceType::Document, Operation::Metadata, p("/db/a.xml"));
        assert_eq!(
            f.run(Handler::UpdateDocumentMetadata, &env).unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(f.store.commit_count(), commits + 1);

        let env = Envelope::new(ResourceType::Document, Operation::Metadata, p("/db/none.xml"));
        assert_eq!(
            f.run(Handler::UpdateDocumentMetadata, &env).unwrap(),
            ApplyOutcome::Converged(SkipReason::SourceDocumentMissing)
        );
    }
}
