//! Compile configuration builders.
//!
//! [`Options`] configures a path-based compile; [`StringOptions`] wraps
//! it with the extra knobs a string entry point has (syntax, URL, and an
//! entry-point importer). Registration-time validation (signature
//! parsing, importer table construction) happens at compile entry, so
//! setters never fail.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use cascade_proto::{OutputStyle, Syntax};

use crate::error::BoxError;
use crate::functions::CustomFunction;
use crate::importers::{FileImporter, Importer, ImporterEntry};
use crate::logger::Logger;
use crate::value::Value;

/// Configuration shared by every compile entry point.
#[must_use = "Options do nothing until passed to a compile call"]
pub struct Options {
    /// Output style.
    pub(crate) style: OutputStyle,
    /// Generate a source map.
    pub(crate) source_map: bool,
    /// Embed full source text in the source map.
    pub(crate) source_map_include_sources: bool,
    /// Filesystem load paths, consulted after explicit importers.
    pub(crate) load_paths: Vec<PathBuf>,
    /// Import resolution chain, in registration order.
    pub(crate) importers: Vec<ImporterEntry>,
    /// Custom functions as `(signature, callback)` pairs.
    pub(crate) functions: Vec<(String, Arc<CustomFunction>)>,
    /// Log event receiver; defaults to [`crate::DefaultLogger`].
    pub(crate) logger: Option<Arc<dyn Logger>>,
    /// Suppress warnings from dependency stylesheets.
    pub(crate) quiet_deps: bool,
    /// Emit all deprecation warnings, even repeated ones.
    pub(crate) verbose: bool,
    /// Permit a leading `@charset`/BOM in the output.
    pub(crate) charset: bool,
    /// Restrict compiler messages to ASCII.
    pub(crate) alert_ascii: bool,
    /// Permit terminal colors in compiler messages.
    pub(crate) alert_color: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            style: OutputStyle::Expanded,
            source_map: false,
            source_map_include_sources: false,
            load_paths: Vec::new(),
            importers: Vec::new(),
            functions: Vec::new(),
            logger: None,
            quiet_deps: false,
            verbose: false,
            charset: true,
            alert_ascii: false,
            alert_color: false,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("style", &self.style)
            .field("source_map", &self.source_map)
            .field("load_paths", &self.load_paths)
            .field("importers", &self.importers.len())
            .field("functions", &self.functions.len())
            .finish_non_exhaustive()
    }
}

impl Options {
    /// Default options: expanded output, no source map, no importers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the output style.
    pub fn style(mut self, style: OutputStyle) -> Self {
        self.style = style;
        self
    }

    /// Enables or disables source map generation.
    pub fn source_map(mut self, enabled: bool) -> Self {
        self.source_map = enabled;
        self
    }

    /// Embeds full source text in the source map.
    pub fn source_map_include_sources(mut self, enabled: bool) -> Self {
        self.source_map_include_sources = enabled;
        self
    }

    /// Appends a filesystem load path.
    pub fn load_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.load_paths.push(path.into());
        self
    }

    /// Appends a canonicalizing importer to the resolution chain.
    pub fn importer(mut self, importer: Arc<dyn Importer>) -> Self {
        self.importers.push(ImporterEntry::Importer(importer));
        self
    }

    /// Appends a file importer to the resolution chain.
    pub fn file_importer(mut self, importer: Arc<dyn FileImporter>) -> Self {
        self.importers.push(ImporterEntry::FileImporter(importer));
        self
    }

    /// Appends an arbitrary resolution chain entry.
    pub fn importer_entry(mut self, entry: ImporterEntry) -> Self {
        self.importers.push(entry);
        self
    }

    /// Registers a custom function under a `"name($params)"` signature.
    ///
    /// The signature is validated when the compile starts; an invalid
    /// one fails the compile call with a host error before any work
    /// reaches the compiler.
    pub fn function<F>(mut self, signature: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&[Value]) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.functions.push((signature.into(), Arc::new(callback)));
        self
    }

    /// Sets the log event receiver.
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Suppresses warnings from dependency stylesheets.
    pub fn quiet_deps(mut self, enabled: bool) -> Self {
        self.quiet_deps = enabled;
        self
    }

    /// Emits all deprecation warnings, even repeated ones.
    pub fn verbose(mut self, enabled: bool) -> Self {
        self.verbose = enabled;
        self
    }

    /// Permits a leading `@charset`/BOM in the output.
    pub fn charset(mut self, enabled: bool) -> Self {
        self.charset = enabled;
        self
    }

    /// Restricts compiler messages to ASCII.
    pub fn alert_ascii(mut self, enabled: bool) -> Self {
        self.alert_ascii = enabled;
        self
    }

    /// Permits terminal colors in compiler messages.
    pub fn alert_color(mut self, enabled: bool) -> Self {
        self.alert_color = enabled;
        self
    }
}

/// Configuration for compiling source text held by the host.
#[must_use = "StringOptions do nothing until passed to compile_string"]
#[derive(Debug, Default)]
pub struct StringOptions {
    /// Shared options.
    pub(crate) options: Options,
    /// Syntax of the source text.
    pub(crate) syntax: Syntax,
    /// Canonical URL of the entry point.
    pub(crate) url: Option<String>,
    /// Importer used to resolve relative loads from the entry point.
    pub(crate) input_importer: Option<ImporterEntry>,
}

impl StringOptions {
    /// Default string options: SCSS syntax, no URL, no entry importer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the shared options.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Sets the syntax of the source text.
    pub fn syntax(mut self, syntax: Syntax) -> Self {
        self.syntax = syntax;
        self
    }

    /// Sets the canonical URL of the entry point.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the importer that resolves relative loads from the entry
    /// point. It takes precedence over the importer list for relative
    /// URLs only and always receives its own importer id.
    pub fn input_importer(mut self, importer: Arc<dyn Importer>) -> Self {
        self.input_importer = Some(ImporterEntry::Importer(importer));
        self
    }

    /// Sets a file importer as the entry-point importer.
    pub fn input_file_importer(mut self, importer: Arc<dyn FileImporter>) -> Self {
        self.input_importer = Some(ImporterEntry::FileImporter(importer));
        self
    }
}
