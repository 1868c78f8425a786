//! RabbitMQ with the management plugin, topology declared via `rabbitmqadmin`.

use std::fmt;

use crate::error::Result;
use crate::lifecycle::{InstanceHandle, InstanceSpec, SetupStep};
use crate::readiness::ReadinessCheck;
use crate::runtime::NativeHealthCheck;
use crate::services::Service;

const RABBITMQADMIN: &str = "rabbitmqadmin";

/// Start a `rabbitmqadmin` argv, scoped to `vhost` when set.
fn admin(vhost: Option<&Vhost>) -> Vec<String> {
    let mut argv = vec![RABBITMQADMIN.to_string()];
    if let Some(vhost) = vhost {
        argv.extend(["--vhost".to_string(), vhost.name.clone()]);
    }
    argv
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vhost {
    pub name: String,
}

impl Vhost {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn declare_command(&self) -> Vec<String> {
        let mut argv = admin(None);
        argv.extend([
            "declare".to_string(),
            "vhost".to_string(),
            format!("name={}", self.name),
        ]);
        argv
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeType,
    pub vhost: Option<Vhost>,
}

impl Exchange {
    pub fn new(name: impl Into<String>, kind: ExchangeType) -> Self {
        Self {
            name: name.into(),
            kind,
            vhost: None,
        }
    }

    pub fn in_vhost(mut self, vhost: Vhost) -> Self {
        self.vhost = Some(vhost);
        self
    }

    pub fn declare_command(&self) -> Vec<String> {
        let mut argv = admin(self.vhost.as_ref());
        argv.extend([
            "declare".to_string(),
            "exchange".to_string(),
            format!("name={}", self.name),
            format!("type={}", self.kind),
        ]);
        argv
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitQueue {
    pub name: String,
    pub durable: bool,
    pub vhost: Option<Vhost>,
}

impl RabbitQueue {
    pub fn new(name: impl Into<String>, durable: bool) -> Self {
        Self {
            name: name.into(),
            durable,
            vhost: None,
        }
    }

    pub fn in_vhost(mut self, vhost: Vhost) -> Self {
        self.vhost = Some(vhost);
        self
    }

    pub fn declare_command(&self) -> Vec<String> {
        let mut argv = admin(self.vhost.as_ref());
        argv.extend([
            "declare".to_string(),
            "queue".to_string(),
            format!("name={}", self.name),
            format!("durable={}", self.durable),
        ]);
        argv
    }
}

/// Routes `source` exchange to `destination` queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub source: String,
    pub destination: String,
    pub routing_key: String,
    pub vhost: Option<Vhost>,
}

impl QueueBinding {
    pub fn new(source: &Exchange, destination: &RabbitQueue, routing_key: impl Into<String>) -> Self {
        Self {
            source: source.name.clone(),
            destination: destination.name.clone(),
            routing_key: routing_key.into(),
            vhost: None,
        }
    }

    pub fn in_vhost(mut self, vhost: Vhost) -> Self {
        self.vhost = Some(vhost);
        self
    }

    pub fn declare_command(&self) -> Vec<String> {
        let mut argv = admin(self.vhost.as_ref());
        argv.extend([
            "declare".to_string(),
            "binding".to_string(),
            format!("source={}", self.source),
            "destination_type=queue".to_string(),
            format!("destination={}", self.destination),
            format!("routing_key={}", self.routing_key),
        ]);
        argv
    }
}

/// RabbitMQ with a declared topology.
///
/// Components are declared once the broker is healthy, in dependency
/// order: vhosts, exchanges, queues, bindings.
#[derive(Debug, Clone, Default)]
pub struct RabbitMq {
    pub name: String,
    pub vhosts: Vec<Vhost>,
    pub exchanges: Vec<Exchange>,
    pub queues: Vec<RabbitQueue>,
    pub bindings: Vec<QueueBinding>,
}

impl RabbitMq {
    pub const IMAGE: &'static str = "rabbitmq:management-alpine";
    pub const PORT: u16 = 5672;

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_vhosts(mut self, vhosts: impl IntoIterator<Item = Vhost>) -> Self {
        self.vhosts.extend(vhosts);
        self
    }

    pub fn add_exchanges(mut self, exchanges: impl IntoIterator<Item = Exchange>) -> Self {
        self.exchanges.extend(exchanges);
        self
    }

    pub fn add_queues(mut self, queues: impl IntoIterator<Item = RabbitQueue>) -> Self {
        self.queues.extend(queues);
        self
    }

    pub fn add_bindings(mut self, bindings: impl IntoIterator<Item = QueueBinding>) -> Self {
        self.bindings.extend(bindings);
        self
    }

    /// `amqp://` URL for a running instance, default guest credentials.
    pub fn url(instance: &InstanceHandle) -> Option<String> {
        let endpoint = instance.endpoint(Self::PORT)?;
        Some(format!("amqp://guest:guest@{endpoint}/"))
    }

    fn declarations(&self) -> impl Iterator<Item = Vec<String>> + '_ {
        self.vhosts
            .iter()
            .map(Vhost::declare_command)
            .chain(self.exchanges.iter().map(Exchange::declare_command))
            .chain(self.queues.iter().map(RabbitQueue::declare_command))
            .chain(self.bindings.iter().map(QueueBinding::declare_command))
    }
}

impl Service for RabbitMq {
    fn spec(&self) -> Result<InstanceSpec> {
        let mut spec = InstanceSpec::new("rabbit", Self::IMAGE)
            .named(&self.name)
            .port(Self::PORT)
            .readiness(ReadinessCheck::native(NativeHealthCheck::shell(format!(
                "{RABBITMQADMIN} -q list queues"
            ))));

        for argv in self.declarations() {
            spec = spec.after_ready(SetupStep::Run(argv));
        }
        Ok(spec)
    }
}
