//! Stanza-processing modules and their registry.
//!
//! A module is a singleton registered under a static identifier. The
//! [`ModuleManager`] routes inbound stanzas to every module whose
//! [`Criteria`] match, fans out scope resets and collects the payloads
//! modules want to piggyback on a SASL2 `<authenticate/>`.

pub mod auth;
pub mod bind;
pub mod features;
pub mod ping;
pub mod sasl;
pub mod sasl2;
pub mod session;
pub mod stream_management;

use std::any::Any;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use minidom::Element;
use tracing::debug;

use crate::context::Context;
use crate::criteria::Criteria;
use crate::error::{ErrorCondition, XmppError};
use crate::stanza::Stanza;

pub use auth::{AuthModule, AuthState};
pub use bind::ResourceBinderModule;
pub use features::{StreamFeatures, StreamFeaturesModule};
pub use ping::PingModule;
pub use sasl::SaslModule;
pub use sasl2::Sasl2Module;
pub use session::SessionEstablishmentModule;
pub use stream_management::{StreamManagementMode, StreamManagementModule};

/// Lifetime of a piece of state.
///
/// `Stream` state dies with the current stream generation (every restart or
/// disconnect). `Session` state survives reconnects as long as the session
/// can be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetScope {
    Stream,
    Session,
}

#[async_trait]
pub trait XmppModule: Send + Sync + 'static {
    /// Service discovery features this module implements.
    fn features(&self) -> &[&'static str] {
        &[]
    }

    /// Inbound elements this module wants to process.
    fn criteria(&self) -> Option<Criteria> {
        None
    }

    async fn process(&self, _ctx: &Arc<Context>, _stanza: Stanza) -> Result<(), XmppError> {
        Err(XmppError::new(ErrorCondition::FeatureNotImplemented))
    }

    fn reset(&self, _ctx: &Context, _scopes: &[ResetScope]) {}

    /// Modules that can be negotiated inline with SASL2 return themselves.
    fn as_sasl2_inline(&self) -> Option<&dyn Sasl2Inline> {
        None
    }
}

/// Static identifier used to register and look up a module type.
pub trait ModuleIdentifier {
    const ID: &'static str;
}

/// Point of the SASL2 exchange an inline payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineStage {
    /// Directly inside `<authenticate/>`.
    AfterSasl,
    /// Inside the Bind 2.0 `<bind/>` request.
    AfterBind,
}

pub trait Sasl2Inline: Send + Sync {
    fn inline_feature(
        &self,
        ctx: &Context,
        stage: InlineStage,
        features: &StreamFeatures,
    ) -> Option<Element>;
}

struct Entry {
    id: &'static str,
    module: Arc<dyn XmppModule>,
    any: Arc<dyn Any + Send + Sync>,
    criteria: Option<Criteria>,
}

#[derive(Default)]
pub struct ModuleManager {
    entries: RwLock<Vec<Entry>>,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module`, replacing any module registered under the same id.
    pub fn register<T: XmppModule + ModuleIdentifier>(&self, module: Arc<T>) -> Arc<T> {
        let criteria = module.criteria();
        let entry = Entry {
            id: T::ID,
            module: module.clone(),
            any: module.clone(),
            criteria,
        };
        let mut entries = self.write();
        entries.retain(|existing| existing.id != T::ID);
        entries.push(entry);
        debug!(module = T::ID, "Module registered");
        module
    }

    pub fn unregister<T: XmppModule + ModuleIdentifier>(&self) -> Option<Arc<T>> {
        let mut entries = self.write();
        let position = entries.iter().position(|entry| entry.id == T::ID)?;
        let entry = entries.remove(position);
        debug!(module = T::ID, "Module unregistered");
        entry.any.downcast::<T>().ok()
    }

    /// The registered module of type `T`.
    ///
    /// # Panics
    ///
    /// Panics when no such module is registered. Use
    /// [`module_or_none`](Self::module_or_none) for optional modules.
    pub fn module<T: XmppModule + ModuleIdentifier>(&self) -> Arc<T> {
        match self.module_or_none::<T>() {
            Some(module) => module,
            None => panic!("module {} is not registered", T::ID),
        }
    }

    pub fn module_or_none<T: XmppModule + ModuleIdentifier>(&self) -> Option<Arc<T>> {
        self.read()
            .iter()
            .find(|entry| entry.id == T::ID)
            .and_then(|entry| entry.any.clone().downcast::<T>().ok())
    }

    pub fn has_module(&self, id: &str) -> bool {
        self.read().iter().any(|entry| entry.id == id)
    }

    /// Every module whose criteria accept `stanza`, in registration order.
    pub fn find_processors(&self, stanza: &Stanza) -> Vec<Arc<dyn XmppModule>> {
        self.read()
            .iter()
            .filter(|entry| {
                entry
                    .criteria
                    .as_ref()
                    .is_some_and(|criteria| criteria.matches(stanza.element()))
            })
            .map(|entry| entry.module.clone())
            .collect()
    }

    /// Union of the disco features of all modules.
    pub fn features(&self) -> Vec<&'static str> {
        let mut features: Vec<&'static str> = Vec::new();
        for entry in self.read().iter() {
            for feature in entry.module.features() {
                if !features.contains(feature) {
                    features.push(feature);
                }
            }
        }
        features
    }

    pub fn reset(&self, ctx: &Context, scopes: &[ResetScope]) {
        for module in self.modules() {
            module.reset(ctx, scopes);
        }
    }

    /// Inline payloads offered by modules for `stage` of a SASL2 exchange.
    pub fn sasl2_inline(
        &self,
        ctx: &Context,
        stage: InlineStage,
        features: &StreamFeatures,
    ) -> Vec<Element> {
        self.modules()
            .iter()
            .filter_map(|module| module.as_sasl2_inline())
            .filter_map(|inline| inline.inline_feature(ctx, stage, features))
            .collect()
    }

    // snapshot so module callbacks run without the registry lock held
    fn modules(&self) -> Vec<Arc<dyn XmppModule>> {
        self.read().iter().map(|entry| entry.module.clone()).collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Entry>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Entry>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
