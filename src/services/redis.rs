//! Redis from the official image.

use crate::error::Result;
use crate::lifecycle::{InstanceHandle, InstanceSpec};
use crate::readiness::ReadinessCheck;
use crate::services::Service;

#[derive(Debug, Clone, Default)]
pub struct Redis {
    pub name: String,
}

impl Redis {
    pub const IMAGE: &'static str = "redis:latest";
    pub const PORT: u16 = 6379;

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn url(instance: &InstanceHandle) -> Option<String> {
        instance.endpoint(Self::PORT).map(|e| e.url("redis"))
    }
}

impl Service for Redis {
    fn spec(&self) -> Result<InstanceSpec> {
        Ok(InstanceSpec::new("redis", Self::IMAGE)
            .named(&self.name)
            .port(Self::PORT)
            .tty(true)
            .readiness(ReadinessCheck::command(["redis-cli", "ping"])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readiness::Probe;

    #[test]
    fn test_spec() {
        let spec = Redis::new("cache").spec().unwrap();
        assert_eq!(spec.kind, "redis");
        assert_eq!(spec.name, "cache");
        assert!(spec.tty);
        assert_eq!(
            spec.readiness.unwrap().probe,
            Probe::Command(vec!["redis-cli".to_string(), "ping".to_string()])
        );
    }
}
