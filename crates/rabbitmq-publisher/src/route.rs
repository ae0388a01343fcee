//! Message type to exchange / routing key resolution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const MESSAGE_TYPE_PLACEHOLDER: &str = "{message_type}";
const ROUTING_KEY_PLACEHOLDER: &str = "{routing_key}";

/// Per message-type routing override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteOverride {
    pub routing_key: String,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
}

/// Where one message is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

/// A durable queue bound to an exchange, declared by `setup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

/// Resolves the route of every message type.
#[derive(Debug, Clone)]
pub struct Router {
    exchange: String,
    routing_key_template: String,
    exchange_template: Option<String>,
    queue_template: String,
    default_queue: Option<Binding>,
    overrides: BTreeMap<String, RouteOverride>,
}

impl Router {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key_template: MESSAGE_TYPE_PLACEHOLDER.to_string(),
            exchange_template: None,
            queue_template: ROUTING_KEY_PLACEHOLDER.to_string(),
            default_queue: None,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_routing_key_template(mut self, template: impl Into<String>) -> Self {
        self.routing_key_template = template.into();
        self
    }

    pub fn with_exchange_template(mut self, template: Option<String>) -> Self {
        self.exchange_template = template;
        self
    }

    pub fn with_queue_template(mut self, template: impl Into<String>) -> Self {
        self.queue_template = template.into();
        self
    }

    /// Bind `queue` to the default exchange so messages without a route override
    /// are not dropped as unroutable.
    pub fn with_default_queue(
        mut self,
        queue: Option<String>,
        binding_key: impl Into<String>,
    ) -> Self {
        let binding_key = binding_key.into();
        self.default_queue = queue.map(|queue| Binding {
            exchange: self.exchange.clone(),
            queue,
            routing_key: binding_key,
        });
        self
    }

    pub fn with_overrides(mut self, overrides: BTreeMap<String, RouteOverride>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn default_exchange(&self) -> &str {
        &self.exchange
    }

    pub fn route(&self, message_type: &str) -> Route {
        match self.overrides.get(message_type) {
            Some(o) => Route {
                exchange: self.override_exchange(o),
                routing_key: o.routing_key.clone(),
            },
            None => Route {
                exchange: self.exchange.clone(),
                routing_key: self
                    .routing_key_template
                    .replace(MESSAGE_TYPE_PLACEHOLDER, message_type),
            },
        }
    }

    fn override_exchange(&self, o: &RouteOverride) -> String {
        match (&o.exchange, &self.exchange_template) {
            (Some(exchange), _) => exchange.clone(),
            (None, Some(template)) => template.replace(ROUTING_KEY_PLACEHOLDER, &o.routing_key),
            (None, None) => self.exchange.clone(),
        }
    }

    /// Every exchange the router can publish to, default first.
    pub fn exchanges(&self) -> Vec<String> {
        let mut exchanges = vec![self.exchange.clone()];
        for o in self.overrides.values() {
            let exchange = self.override_exchange(o);
            if !exchanges.contains(&exchange) {
                exchanges.push(exchange);
            }
        }
        exchanges
    }

    /// Queue bindings for the default queue and every configured override.
    pub fn bindings(&self) -> Vec<Binding> {
        let overrides = self.overrides.values().map(|o| Binding {
            exchange: self.override_exchange(o),
            queue: o.queue.clone().unwrap_or_else(|| {
                self.queue_template
                    .replace(ROUTING_KEY_PLACEHOLDER, &o.routing_key)
            }),
            routing_key: o.routing_key.clone(),
        });
        self.default_queue.iter().cloned().chain(overrides).collect()
    }
}
