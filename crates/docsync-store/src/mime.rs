//! Mime type resolution by name or file extension.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::store::ResourceKind;

/// A registered mime type and whether it is stored as structured content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MimeType {
    /// Mime name, e.g. `application/xml`.
    pub name: String,
    /// Storage kind for resources of this type.
    pub kind: ResourceKind,
}

impl MimeType {
    /// Returns true if resources of this type are stored as XML.
    pub fn is_xml(&self) -> bool {
        self.kind == ResourceKind::Xml
    }
}

/// Lookup table from mime names and file extensions to [`MimeType`]s.
#[derive(Clone, Debug)]
pub struct MimeTable {
    by_name: HashMap<String, MimeType>,
    by_extension: HashMap<String, String>,
}

impl MimeTable {
    /// An empty table.
    pub fn empty() -> Self {
        Self {
            by_name: HashMap::new(),
            by_extension: HashMap::new(),
        }
    }

    /// Register a mime type with the extensions (without dot) that map to it.
    pub fn register(&mut self, name: &str, kind: ResourceKind, extensions: &[&str]) {
        self.by_name.insert(
            name.to_string(),
            MimeType {
                name: name.to_string(),
                kind,
            },
        );
        for ext in extensions {
            self.by_extension
                .insert(ext.to_ascii_lowercase(), name.to_string());
        }
    }

    /// Look up a mime type by its name.
    pub fn for_name(&self, name: &str) -> Option<&MimeType> {
        self.by_name.get(name.trim())
    }

    /// Look up a mime type from the extension of a file name or path.
    pub fn content_type_for(&self, file_name: &str) -> Option<&MimeType> {
        let base = file_name.rsplit('/').next().unwrap_or(file_name);
        let (_, ext) = base.rsplit_once('.')?;
        let name = self.by_extension.get(&ext.to_ascii_lowercase())?;
        self.by_name.get(name)
    }
}

impl Default for MimeTable {
    fn default() -> Self {
        use ResourceKind::{Binary, Xml};

        let mut table = Self::empty();
        table.register("application/xml", Xml, &["xml", "xsd", "xsl", "xslt", "rdf", "xconf", "xmap"]);
        table.register("text/xml", Xml, &[]);
        table.register("application/xhtml+xml", Xml, &["xhtml"]);
        table.register("image/svg+xml", Xml, &["svg"]);
        table.register("application/atom+xml", Xml, &["atom"]);
        table.register("application/xquery", Binary, &["xq", "xql", "xqm", "xquery"]);
        table.register("text/plain", Binary, &["txt", "text"]);
        table.register("text/html", Binary, &["html", "htm"]);
        table.register("text/css", Binary, &["css"]);
        table.register("application/javascript", Binary, &["js"]);
        table.register("application/json", Binary, &["json"]);
        table.register("image/png", Binary, &["png"]);
        table.register("image/jpeg", Binary, &["jpg", "jpeg"]);
        table.register("image/gif", Binary, &["gif"]);
        table.register("application/pdf", Binary, &["pdf"]);
        table.register("application/zip", Binary, &["zip"]);
        table.register("application/octet-stream", Binary, &["bin"]);
        table
    }
}
