//! Importer contracts and the per-compilation importer table.
//!
//! Importers come in two shapes: a canonicalizing [`Importer`] that both
//! resolves URLs and loads their contents, and a [`FileImporter`] that
//! only redirects URLs to `file:` URLs for the compiler to load itself.
//! Registration is a closed enum, so a single object can never offer
//! both roles at once. Each registration receives its own importer id
//! for the lifetime of one compilation; the compiler addresses callbacks
//! by that id.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use cascade_proto::{
    CanonicalizeResult, FileImportResult, ImportResult, ImportSuccess, ImporterSpec, Syntax,
};

use crate::error::{BoxError, Error, Result};

/// Context passed to canonicalize and find-file-url callbacks.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ImporterContext {
    /// `true` when the load came from `@import`, `false` for `@use`,
    /// `@forward`, and `meta.load-css`.
    pub from_import: bool,
    /// Canonical URL of the stylesheet containing the load, when known.
    pub containing_url: Option<String>,
}

/// Source loaded by an [`Importer`].
// Constructed field-by-field by importer implementations.
#[allow(clippy::exhaustive_structs)]
#[derive(Debug, Clone)]
pub struct ImporterSource {
    /// Stylesheet text.
    pub contents: String,
    /// Syntax of the text.
    pub syntax: Syntax,
    /// Absolute URL to report in source maps instead of the canonical
    /// URL, if any.
    pub source_map_url: Option<String>,
}

/// A canonicalizing importer: resolves URLs and loads their contents.
pub trait Importer: Send + Sync {
    /// Resolves `url` to an absolute canonical URL, or `None` when this
    /// importer does not recognize it.
    fn canonicalize(
        &self,
        url: &str,
        context: &ImporterContext,
    ) -> std::result::Result<Option<String>, BoxError>;

    /// Loads the contents of a canonical URL this importer produced, or
    /// `None` when the URL has no content.
    fn load(&self, canonical_url: &str) -> std::result::Result<Option<ImporterSource>, BoxError>;
}

/// An importer that redirects URLs to `file:` URLs the compiler loads
/// itself.
pub trait FileImporter: Send + Sync {
    /// Resolves `url` to an absolute `file:` URL, or `None` when this
    /// importer does not recognize it.
    fn find_file_url(
        &self,
        url: &str,
        context: &ImporterContext,
    ) -> std::result::Result<Option<String>, BoxError>;
}

/// One entry in the import resolution chain.
///
/// The enum is the registration surface: an object offering both
/// [`Importer`] and [`FileImporter`] behavior cannot be registered as a
/// single ambiguous entry.
#[derive(Clone)]
#[non_exhaustive]
pub enum ImporterEntry {
    /// A canonicalizing importer.
    Importer(Arc<dyn Importer>),
    /// A file importer.
    FileImporter(Arc<dyn FileImporter>),
    /// A filesystem load path.
    LoadPath(PathBuf),
}

impl fmt::Debug for ImporterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Importer(_) => f.write_str("ImporterEntry::Importer"),
            Self::FileImporter(_) => f.write_str("ImporterEntry::FileImporter"),
            Self::LoadPath(path) => f.debug_tuple("ImporterEntry::LoadPath").field(path).finish(),
        }
    }
}

impl From<Arc<dyn Importer>> for ImporterEntry {
    fn from(importer: Arc<dyn Importer>) -> Self {
        Self::Importer(importer)
    }
}

impl From<Arc<dyn FileImporter>> for ImporterEntry {
    fn from(importer: Arc<dyn FileImporter>) -> Self {
        Self::FileImporter(importer)
    }
}

/// An id-addressable importer stored for one compilation.
#[derive(Clone)]
enum Stored {
    Importer(Arc<dyn Importer>),
    FileImporter(Arc<dyn FileImporter>),
}

/// Per-compilation importer table.
///
/// Ids are assigned in registration order, with the entry-point importer
/// (when present) always receiving its own id, distinct from any list
/// registration of the same object.
#[derive(Default)]
pub(crate) struct ImporterStore {
    by_id: HashMap<u32, Stored>,
}

impl fmt::Debug for ImporterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImporterStore")
            .field("registered", &self.by_id.len())
            .finish()
    }
}

impl ImporterStore {
    /// Builds the table and the wire import chain for one compilation.
    ///
    /// Returns the store, the `CompileRequest.importers` list in
    /// precedence order (explicit importers first, load paths after),
    /// and the wire entry for the entry-point importer if one was given.
    pub(crate) fn build(
        entry_importer: Option<&ImporterEntry>,
        importers: &[ImporterEntry],
        load_paths: &[PathBuf],
    ) -> Result<(Self, Vec<ImporterSpec>, Option<ImporterSpec>)> {
        let mut store = Self::default();
        let mut next_id = 0u32;

        if matches!(entry_importer, Some(ImporterEntry::LoadPath(_))) {
            return Err(Error::Host(
                "a load path cannot serve as the entry-point importer".into(),
            ));
        }
        let entry_spec = entry_importer
            .map(|entry| store.add(entry, &mut next_id))
            .transpose()?;

        let mut specs = Vec::with_capacity(importers.len() + load_paths.len());
        for entry in importers {
            specs.push(store.add(entry, &mut next_id)?);
        }
        for path in load_paths {
            specs.push(ImporterSpec::Path(path.to_string_lossy().into_owned()));
        }

        Ok((store, specs, entry_spec))
    }

    fn add(&mut self, entry: &ImporterEntry, next_id: &mut u32) -> Result<ImporterSpec> {
        let spec = match entry {
            ImporterEntry::Importer(importer) => {
                self.by_id.insert(*next_id, Stored::Importer(Arc::clone(importer)));
                ImporterSpec::ImporterId(*next_id)
            }
            ImporterEntry::FileImporter(importer) => {
                self.by_id
                    .insert(*next_id, Stored::FileImporter(Arc::clone(importer)));
                ImporterSpec::FileImporterId(*next_id)
            }
            ImporterEntry::LoadPath(path) => {
                return Ok(ImporterSpec::Path(path.to_string_lossy().into_owned()));
            }
        };
        *next_id += 1;
        Ok(spec)
    }

    /// Runs a canonicalize callback, mapping every failure mode to the
    /// wire result.
    pub(crate) fn canonicalize(
        &self,
        importer_id: u32,
        url: &str,
        context: &ImporterContext,
    ) -> CanonicalizeResult {
        let Some(Stored::Importer(importer)) = self.by_id.get(&importer_id) else {
            return CanonicalizeResult::Error(format!(
                "no canonicalizing importer registered with id {importer_id}"
            ));
        };
        match importer.canonicalize(url, context) {
            Ok(None) => CanonicalizeResult::Skip,
            Ok(Some(canonical)) => {
                if is_absolute_url(&canonical) {
                    CanonicalizeResult::Url(canonical)
                } else {
                    CanonicalizeResult::Error(format!(
                        "the importer must return an absolute URL, was \"{canonical}\""
                    ))
                }
            }
            Err(error) => CanonicalizeResult::Error(error.to_string()),
        }
    }

    /// Runs a load callback, mapping every failure mode to the wire
    /// result.
    pub(crate) fn load(&self, importer_id: u32, canonical_url: &str) -> ImportResult {
        let Some(Stored::Importer(importer)) = self.by_id.get(&importer_id) else {
            return ImportResult::Error(format!(
                "no canonicalizing importer registered with id {importer_id}"
            ));
        };
        match importer.load(canonical_url) {
            Ok(None) => ImportResult::Skip,
            Ok(Some(source)) => {
                if let Some(map_url) = &source.source_map_url
                    && !is_absolute_url(map_url)
                {
                    return ImportResult::Error(format!(
                        "the importer must return an absolute URL for source_map_url, \
                         was \"{map_url}\""
                    ));
                }
                ImportResult::Success(ImportSuccess {
                    contents: source.contents,
                    syntax: source.syntax,
                    source_map_url: source.source_map_url,
                })
            }
            Err(error) => ImportResult::Error(error.to_string()),
        }
    }

    /// Runs a find-file-url callback, mapping every failure mode to the
    /// wire result.
    pub(crate) fn find_file_url(
        &self,
        importer_id: u32,
        url: &str,
        context: &ImporterContext,
    ) -> FileImportResult {
        let Some(Stored::FileImporter(importer)) = self.by_id.get(&importer_id) else {
            return FileImportResult::Error(format!(
                "no file importer registered with id {importer_id}"
            ));
        };
        match importer.find_file_url(url, context) {
            Ok(None) => FileImportResult::Skip,
            Ok(Some(file_url)) => {
                if file_url.starts_with("file:") {
                    FileImportResult::FileUrl(file_url)
                } else {
                    FileImportResult::Error(format!(
                        "the file importer must return a file: URL, was \"{file_url}\""
                    ))
                }
            }
            Err(error) => FileImportResult::Error(error.to_string()),
        }
    }
}

/// `true` when `url` starts with an RFC 3986 scheme followed by `:`.
pub(crate) fn is_absolute_url(url: &str) -> bool {
    let Some((scheme, _)) = url.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Static {
        canonical: Option<String>,
        source: Option<&'static str>,
    }

    impl Importer for Static {
        fn canonicalize(
            &self,
            _url: &str,
            _context: &ImporterContext,
        ) -> std::result::Result<Option<String>, BoxError> {
            Ok(self.canonical.clone())
        }

        fn load(
            &self,
            _canonical_url: &str,
        ) -> std::result::Result<Option<ImporterSource>, BoxError> {
            Ok(self.source.map(|contents| ImporterSource {
                contents: contents.to_owned(),
                syntax: Syntax::Scss,
                source_map_url: None,
            }))
        }
    }

    struct StaticFile {
        url: &'static str,
    }

    impl FileImporter for StaticFile {
        fn find_file_url(
            &self,
            _url: &str,
            _context: &ImporterContext,
        ) -> std::result::Result<Option<String>, BoxError> {
            Ok(Some(self.url.to_owned()))
        }
    }

    fn context() -> ImporterContext {
        ImporterContext {
            from_import: false,
            containing_url: None,
        }
    }

    #[test]
    fn absolute_url_check() {
        assert!(is_absolute_url("u:orange"));
        assert!(is_absolute_url("file:///C:/orange"));
        assert!(is_absolute_url("custom+scheme.x://y"));
        assert!(!is_absolute_url("orange"));
        assert!(!is_absolute_url("../up"));
        assert!(!is_absolute_url(":missing"));
        assert!(!is_absolute_url("1http://x"));
    }

    #[test]
    fn chain_keeps_registration_order_with_load_paths_last() {
        let importer: Arc<dyn Importer> = Arc::new(Static {
            canonical: None,
            source: None,
        });
        let file_importer: Arc<dyn FileImporter> = Arc::new(StaticFile { url: "file:///x" });
        let entries = vec![
            ImporterEntry::Importer(importer),
            ImporterEntry::LoadPath(PathBuf::from("styles")),
            ImporterEntry::FileImporter(file_importer),
        ];
        let (_, specs, entry_spec) =
            ImporterStore::build(None, &entries, &[PathBuf::from("vendor")]).unwrap();
        assert_eq!(
            specs,
            vec![
                ImporterSpec::ImporterId(0),
                ImporterSpec::Path("styles".into()),
                ImporterSpec::FileImporterId(1),
                ImporterSpec::Path("vendor".into()),
            ]
        );
        assert!(entry_spec.is_none());
    }

    #[test]
    fn entry_importer_gets_its_own_id() {
        let importer: Arc<dyn Importer> = Arc::new(Static {
            canonical: None,
            source: None,
        });
        let entry = ImporterEntry::Importer(Arc::clone(&importer));
        let list = vec![ImporterEntry::Importer(importer)];
        let (_, specs, entry_spec) = ImporterStore::build(Some(&entry), &list, &[]).unwrap();
        assert_eq!(entry_spec, Some(ImporterSpec::ImporterId(0)));
        assert_eq!(specs, vec![ImporterSpec::ImporterId(1)]);
    }

    #[test]
    fn relative_canonical_url_is_an_error() {
        let importer: Arc<dyn Importer> = Arc::new(Static {
            canonical: Some("not-absolute".into()),
            source: None,
        });
        let (store, _, _) =
            ImporterStore::build(None, &[ImporterEntry::Importer(importer)], &[]).unwrap();
        let result = store.canonicalize(0, "orange", &context());
        assert!(matches!(
            result,
            CanonicalizeResult::Error(m) if m.contains("absolute URL")
        ));
    }

    #[test]
    fn skip_and_success_loads() {
        let importer: Arc<dyn Importer> = Arc::new(Static {
            canonical: Some("u:orange".into()),
            source: Some(".orange {color: orange}"),
        });
        let (store, _, _) =
            ImporterStore::build(None, &[ImporterEntry::Importer(importer)], &[]).unwrap();

        assert_eq!(
            store.canonicalize(0, "orange", &context()),
            CanonicalizeResult::Url("u:orange".into())
        );
        assert!(matches!(
            store.load(0, "u:orange"),
            ImportResult::Success(s) if s.contents.contains("orange")
        ));

        let empty: Arc<dyn Importer> = Arc::new(Static {
            canonical: None,
            source: None,
        });
        let (store, _, _) =
            ImporterStore::build(None, &[ImporterEntry::Importer(empty)], &[]).unwrap();
        assert_eq!(store.canonicalize(0, "orange", &context()), CanonicalizeResult::Skip);
        assert!(matches!(store.load(0, "u:orange"), ImportResult::Skip));
    }

    #[test]
    fn non_file_url_from_file_importer_is_an_error() {
        let importer: Arc<dyn FileImporter> = Arc::new(StaticFile { url: "https://x" });
        let (store, _, _) =
            ImporterStore::build(None, &[ImporterEntry::FileImporter(importer)], &[]).unwrap();
        let result = store.find_file_url(0, "orange", &context());
        assert!(matches!(
            result,
            FileImportResult::Error(m) if m.contains("file: URL")
        ));
    }

    #[test]
    fn unknown_importer_id_is_an_error_result() {
        let store = ImporterStore::default();
        assert!(matches!(
            store.canonicalize(4, "x", &context()),
            CanonicalizeResult::Error(_)
        ));
        assert!(matches!(store.load(4, "x"), ImportResult::Error(_)));
        assert!(matches!(
            store.find_file_url(4, "x", &context()),
            FileImportResult::Error(_)
        ));
    }
}
