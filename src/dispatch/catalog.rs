//! Handler discovery.
//!
//! Handler sets are contributed by [`HandlerProvider`]s at startup. Each
//! provider declares the protocol versions it knows and registers handlers
//! against them; a version may inherit every handler of an older version
//! and override individual codes.

use super::handler::PacketHandler;
use super::preprocess::Requirement;
use crate::codec::EncodingKind;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A protocol version clients may negotiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSpec {
    pub version: u32,
    pub encoding: EncodingKind,
    /// Older version whose handlers this one starts from.
    pub inherits: Option<u32>,
}

impl VersionSpec {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            encoding: EncodingKind::default(),
            inherits: None,
        }
    }

    pub fn encoding(mut self, encoding: EncodingKind) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn inherits(mut self, base: u32) -> Self {
        self.inherits = Some(base);
        self
    }
}

/// One registered handler.
#[derive(Clone)]
pub struct HandlerEntry {
    pub version: u32,
    pub code: u8,
    pub requirement: Requirement,
    pub handler: Arc<dyn PacketHandler>,
}

/// Contributes handlers to a [`HandlerCatalog`].
pub trait HandlerProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn register(&self, catalog: &mut HandlerCatalog);
}

/// Every known version and handler, in registration order.
#[derive(Default, Clone)]
pub struct HandlerCatalog {
    versions: BTreeMap<u32, VersionSpec>,
    entries: Vec<HandlerEntry>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a provider against this catalog.
    pub fn with_provider(&mut self, provider: &dyn HandlerProvider) -> &mut Self {
        let before = self.entries.len();
        provider.register(self);
        info!(
            provider = provider.name(),
            handlers = self.entries.len() - before,
            "Registered packet handlers"
        );
        self
    }

    /// Declare a version. Declaring it again replaces the earlier spec.
    pub fn add_version(&mut self, spec: VersionSpec) -> &mut Self {
        if let Some(old) = self.versions.insert(spec.version, spec) {
            debug!(version = old.version, "Version redeclared");
        }
        self
    }

    pub fn register<H>(&mut self, version: u32, code: u8, requirement: Requirement, handler: H) -> &mut Self
    where
        H: PacketHandler + 'static,
    {
        self.register_shared(version, code, requirement, Arc::new(handler))
    }

    pub fn register_shared(
        &mut self,
        version: u32,
        code: u8,
        requirement: Requirement,
        handler: Arc<dyn PacketHandler>,
    ) -> &mut Self {
        self.entries.push(HandlerEntry {
            version,
            code,
            requirement,
            handler,
        });
        self
    }

    pub fn version(&self, version: u32) -> Option<&VersionSpec> {
        self.versions.get(&version)
    }

    pub fn versions(&self) -> impl Iterator<Item = &VersionSpec> {
        self.versions.values()
    }

    /// Handlers registered directly against `version`, in order.
    pub fn entries_for(&self, version: u32) -> impl Iterator<Item = &HandlerEntry> {
        self.entries.iter().filter(move |e| e.version == version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
