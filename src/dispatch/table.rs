//! Per-version dispatch tables and the cache that builds them.

use super::catalog::HandlerCatalog;
use super::handler::PacketHandler;
use super::preprocess::Preprocessor;
use crate::codec::{hex_dump, PacketEncoding, PacketIn};
use crate::net::Connection;
use crate::stats::NetStats;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, enabled, error, info, trace, warn, Level};

/// Timing limits applied around every handler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Handlers slower than this get a warning.
    pub slow_handler: Duration,
    /// A handler still running after this is reported while it runs.
    pub watchdog: Option<Duration>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            slow_handler: Duration::from_millis(1000),
            watchdog: Some(Duration::from_secs(10)),
        }
    }
}

/// What happened to one inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// No handler for the code in this version.
    Unhandled,
    /// The session was not far enough along for this code.
    Vetoed,
    /// The handler returned an error or panicked.
    Failed,
}

#[derive(Clone)]
struct Slot {
    handler: Arc<dyn PacketHandler>,
    origin: u32,
}

/// Code -> handler mapping for one protocol version, plus its encoding.
///
/// Immutable once built; shared by every connection of that version.
pub struct DispatchTable {
    version: u32,
    encoding: Arc<dyn PacketEncoding>,
    slots: Vec<Option<Slot>>,
    preprocessor: Preprocessor,
    settings: DispatchSettings,
    stats: Arc<NetStats>,
}

impl DispatchTable {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn encoding(&self) -> &dyn PacketEncoding {
        self.encoding.as_ref()
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    pub fn handler(&self, code: u8) -> Option<&Arc<dyn PacketHandler>> {
        self.slots[code as usize].as_ref().map(|slot| &slot.handler)
    }

    /// Number of codes with a handler.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the handler for `packet` on behalf of `conn`.
    ///
    /// Never panics and never closes the connection; faults are logged with
    /// connection context and counted.
    pub fn dispatch(&self, conn: &Arc<Connection>, packet: &PacketIn) -> DispatchOutcome {
        let code = packet.code();
        conn.record_inbound(packet);
        self.stats.record_in(packet.frame_size());

        if enabled!(Level::TRACE) {
            trace!(
                conn = %conn.id(),
                "{}",
                hex_dump(&format!("<=== 0x{code:02X}"), packet.payload())
            );
        }

        let Some(slot) = &self.slots[code as usize] else {
            debug!(
                conn = %conn.id(),
                version = self.version,
                "No handler for packet code 0x{code:02X}, dropped"
            );
            self.stats.record_dropped();
            return DispatchOutcome::Unhandled;
        };

        let state = conn.session().state();
        if !self.preprocessor.can_process(code, state) {
            info!(
                conn = %conn.id(),
                peer = %conn.peer(),
                %state,
                requirement = %self.preprocessor.requirement(code),
                "Preprocessor vetoed packet code 0x{code:02X}"
            );
            self.stats.record_dropped();
            return DispatchOutcome::Vetoed;
        }

        let name = slot.handler.name();
        let watchdog = self.arm_watchdog(conn, name, code);
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| slot.handler.handle(conn, packet)));
        let elapsed = started.elapsed();
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        if elapsed > self.settings.slow_handler {
            warn!(
                conn = %conn.id(),
                handler = name,
                version = slot.origin,
                elapsed_ms = elapsed.as_millis() as u64,
                "Long packet handler 0x{code:02X}"
            );
        }

        match result {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(e)) => {
                error!(
                    conn = %conn.id(),
                    peer = %conn.peer(),
                    handler = name,
                    error = %e,
                    "Error while processing packet 0x{code:02X}"
                );
                self.stats.record_handler_fault();
                DispatchOutcome::Failed
            }
            Err(payload) => {
                error!(
                    conn = %conn.id(),
                    peer = %conn.peer(),
                    handler = name,
                    panic = panic_message(payload.as_ref()),
                    "Packet handler 0x{code:02X} panicked"
                );
                self.stats.record_handler_fault();
                DispatchOutcome::Failed
            }
        }
    }

    /// Spawn a task that reports the handler if it outlives the watchdog.
    fn arm_watchdog(
        &self,
        conn: &Connection,
        name: &'static str,
        code: u8,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let limit = self.settings.watchdog?;
        let runtime = Handle::try_current().ok()?;
        let conn_id = conn.id();
        let version = self.version;
        Some(runtime.spawn(async move {
            tokio::time::sleep(limit).await;
            error!(
                conn = %conn_id,
                handler = name,
                version,
                limit_ms = limit.as_millis() as u64,
                "Packet handler 0x{code:02X} still running"
            );
        }))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Builds dispatch tables from a catalog on first use and caches them by
/// version.
pub struct DispatchRegistry {
    catalog: HandlerCatalog,
    settings: DispatchSettings,
    stats: Arc<NetStats>,
    cache: Mutex<HashMap<u32, Arc<DispatchTable>>>,
}

impl DispatchRegistry {
    pub fn new(catalog: HandlerCatalog, settings: DispatchSettings, stats: Arc<NetStats>) -> Self {
        Self {
            catalog,
            settings,
            stats,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &HandlerCatalog {
        &self.catalog
    }

    pub fn is_supported(&self, version: u32) -> bool {
        self.catalog.version(version).is_some()
    }

    /// The table for `version`, or `None` when no provider declared it.
    ///
    /// The first caller for a version builds the table under the cache
    /// lock; everyone after that shares it.
    pub fn table_for(&self, version: u32) -> Option<Arc<DispatchTable>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = cache.get(&version) {
            return Some(Arc::clone(table));
        }

        let table = Arc::new(self.build(version)?);
        info!(
            version,
            handlers = table.len(),
            encoding = table.encoding().name(),
            "Loaded packet handlers"
        );
        cache.insert(version, Arc::clone(&table));
        Some(table)
    }

    fn build(&self, version: u32) -> Option<DispatchTable> {
        let spec = self.catalog.version(version)?;

        // base first, so each derived version overlays its ancestors
        let mut chain = vec![version];
        let mut seen = BTreeSet::from([version]);
        let mut cursor = spec.inherits;
        while let Some(base) = cursor {
            if !seen.insert(base) {
                warn!(version, base, "Inheritance cycle, chain truncated");
                break;
            }
            chain.push(base);
            cursor = match self.catalog.version(base) {
                Some(base_spec) => base_spec.inherits,
                None => {
                    warn!(version, base, "Inherits from an undeclared version");
                    None
                }
            };
        }
        chain.reverse();

        let mut slots: Vec<Option<Slot>> = vec![None; 256];
        let mut preprocessor = Preprocessor::default();
        for origin in chain {
            for entry in self.catalog.entries_for(origin) {
                let slot = &mut slots[entry.code as usize];
                match slot {
                    Some(old) if old.origin == origin => warn!(
                        version = origin,
                        old = old.handler.name(),
                        new = entry.handler.name(),
                        "Overwriting handler for packet code 0x{:02X}",
                        entry.code
                    ),
                    Some(old) => debug!(
                        version,
                        from = old.origin,
                        to = origin,
                        "Handler for packet code 0x{:02X} overridden",
                        entry.code
                    ),
                    None => {}
                }
                *slot = Some(Slot {
                    handler: Arc::clone(&entry.handler),
                    origin,
                });
                preprocessor.set(entry.code, entry.requirement);
            }
        }

        Some(DispatchTable {
            version,
            encoding: spec.encoding.build(),
            slots,
            preprocessor,
            settings: self.settings,
            stats: Arc::clone(&self.stats),
        })
    }
}
