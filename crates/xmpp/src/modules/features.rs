//! `<stream:features/>` tracking.

use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;
use tokio::sync::watch;
use tracing::debug;

use crate::connector::transport::ChannelBindingType;
use crate::context::Context;
use crate::criteria::Criteria;
use crate::error::XmppError;
use crate::modules::{ModuleIdentifier, ResetScope, XmppModule};
use crate::ns;
use crate::stanza::Stanza;

/// Features announced by the server for one stream generation.
///
/// A new stream always replaces the previous snapshot; features are never
/// merged across restarts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamFeatures {
    element: Option<Element>,
    generation: u64,
}

impl StreamFeatures {
    pub fn new(element: Element) -> Self {
        Self {
            element: Some(element),
            generation: 0,
        }
    }

    pub fn is_none(&self) -> bool {
        self.element.is_none()
    }

    /// Counter distinguishing successive `<stream:features/>` elements.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn element(&self) -> Option<&Element> {
        self.element.as_ref()
    }

    pub fn get(&self, name: &str, xmlns: &str) -> Option<&Element> {
        self.element.as_ref()?.get_child(name, xmlns)
    }

    pub fn contains(&self, name: &str, xmlns: &str) -> bool {
        self.get(name, xmlns).is_some()
    }

    pub fn supports_starttls(&self) -> bool {
        self.contains("starttls", ns::TLS)
    }

    pub fn is_starttls_required(&self) -> bool {
        self.get("starttls", ns::TLS)
            .is_some_and(|starttls| starttls.get_child("required", ns::TLS).is_some())
    }

    pub fn compression_methods(&self) -> Vec<String> {
        texts(self.get("compression", ns::COMPRESS_FEATURE), "method")
    }

    pub fn supports_zlib(&self) -> bool {
        self.compression_methods().iter().any(|m| m == "zlib")
    }

    pub fn supports_sasl(&self) -> bool {
        self.contains("mechanisms", ns::SASL)
    }

    pub fn sasl_mechanisms(&self) -> Vec<String> {
        texts(self.get("mechanisms", ns::SASL), "mechanism")
    }

    pub fn supports_sasl2(&self) -> bool {
        self.contains("authentication", ns::SASL2)
    }

    pub fn sasl2_mechanisms(&self) -> Vec<String> {
        texts(self.get("authentication", ns::SASL2), "mechanism")
    }

    /// Mechanisms offered for SASL2 upgrade tasks, without the `UPGR-` prefix.
    pub fn sasl2_upgrades(&self) -> Vec<String> {
        texts(self.get("authentication", ns::SASL2), "upgrade")
            .into_iter()
            .map(|task| match task.strip_prefix("UPGR-") {
                Some(name) => name.to_string(),
                None => task,
            })
            .collect()
    }

    /// The `<inline/>` element of the SASL2 feature.
    pub fn sasl2_inline(&self) -> Option<&Element> {
        self.get("authentication", ns::SASL2)?.get_child("inline", ns::SASL2)
    }

    pub fn supports_sasl2_inline(&self, name: &str, xmlns: &str) -> bool {
        self.sasl2_inline()
            .is_some_and(|inline| inline.get_child(name, xmlns).is_some())
    }

    /// FAST mechanisms the server accepts tokens for.
    pub fn fast_mechanisms(&self) -> Vec<String> {
        texts(
            self.sasl2_inline()
                .and_then(|inline| inline.get_child("fast", ns::FAST)),
            "mechanism",
        )
    }

    pub fn supports_bind2(&self) -> bool {
        self.supports_sasl2_inline("bind", ns::BIND2)
    }

    /// `var`s of the features the server accepts inline with Bind 2.0.
    pub fn bind2_inline_features(&self) -> Vec<String> {
        self.sasl2_inline()
            .and_then(|inline| inline.get_child("bind", ns::BIND2))
            .and_then(|bind| bind.get_child("inline", ns::BIND2))
            .map(|inline| {
                inline
                    .children()
                    .filter(|child| child.name() == "feature")
                    .filter_map(|child| child.attr("var"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn channel_bindings(&self) -> Vec<ChannelBindingType> {
        self.get("sasl-channel-binding", ns::SASL_CB)
            .map(|bindings| {
                bindings
                    .children()
                    .filter(|child| child.name() == "channel-binding")
                    .filter_map(|child| child.attr("type"))
                    .filter_map(ChannelBindingType::from_name)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn supports_bind(&self) -> bool {
        self.contains("bind", ns::BIND)
    }

    /// `<session/>` is advertised without `<optional/>`.
    pub fn is_session_required(&self) -> bool {
        self.get("session", ns::SESSION)
            .is_some_and(|session| session.get_child("optional", ns::SESSION).is_none())
    }

    pub fn supports_stream_management(&self) -> bool {
        self.contains("sm", ns::SM)
    }

    pub fn supports_register(&self) -> bool {
        self.contains("register", ns::REGISTER_FEATURE)
    }
}

fn texts(parent: Option<&Element>, name: &str) -> Vec<String> {
    parent
        .map(|parent| {
            parent
                .children()
                .filter(|child| child.name() == name)
                .map(|child| child.text().trim().to_string())
                .filter(|text| !text.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Publishes every received `<stream:features/>` as a [`StreamFeatures`].
pub struct StreamFeaturesModule {
    features: watch::Sender<StreamFeatures>,
}

impl StreamFeaturesModule {
    pub fn new() -> Self {
        let (features, _) = watch::channel(StreamFeatures::default());
        Self { features }
    }

    pub fn stream_features(&self) -> StreamFeatures {
        self.features.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamFeatures> {
        self.features.subscribe()
    }

    pub(crate) fn publish(&self, element: Element) {
        self.features.send_modify(|features| {
            features.element = Some(element);
            features.generation += 1;
        });
    }
}

impl Default for StreamFeaturesModule {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleIdentifier for StreamFeaturesModule {
    const ID: &'static str = "stream-features";
}

#[async_trait]
impl XmppModule for StreamFeaturesModule {
    fn criteria(&self) -> Option<Criteria> {
        Some(Criteria::name("features").xmlns(ns::STREAM))
    }

    async fn process(&self, _ctx: &Arc<Context>, stanza: Stanza) -> Result<(), XmppError> {
        debug!(features = %stanza, "Stream features received");
        self.publish(stanza.into_element());
        Ok(())
    }

    fn reset(&self, _ctx: &Context, scopes: &[ResetScope]) {
        if scopes.contains(&ResetScope::Stream) {
            // silent: observers only react to new features
            self.features.send_if_modified(|features| {
                features.element = None;
                false
            });
        }
    }
}
