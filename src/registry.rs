//! 注册表
//! 上游模型注册表（供校验器解析模型名）与防火墙注册表（有序的防火墙实例集合）

use crate::classifier::{Classifier, ClassifierProvider};
use crate::config::{FirewallSettings, ModelSettings};
use crate::error::{AppError, Result};
use crate::models::firewall::FirewallConfig;
use crate::models::payload::{ModelDescriptor, ModelLookup, ModelName};
use std::collections::HashMap;
use std::sync::Arc;

/// 静态模型注册表
#[derive(Debug, Default, Clone)]
pub struct StaticModelRegistry {
    models: HashMap<ModelName, ModelDescriptor>,
}

impl StaticModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &[ModelSettings]) -> Result<Self> {
        let mut registry = Self::new();
        for entry in settings {
            registry.register(ModelDescriptor {
                name: ModelName::parse(&entry.name)?,
                provider: entry.provider.clone(),
                target_url: entry.target_url.clone(),
            });
        }
        Ok(registry)
    }

    pub fn register(&mut self, descriptor: ModelDescriptor) {
        self.models.insert(descriptor.name.clone(), descriptor);
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl ModelLookup for StaticModelRegistry {
    fn lookup(&self, name: &ModelName) -> Option<ModelDescriptor> {
        self.models.get(name).cloned()
    }
}

/// 绑定了分类器的防火墙
#[derive(Clone)]
pub struct RegisteredFirewall {
    pub config: FirewallConfig,
    pub classifier: Arc<dyn Classifier>,
}

/// 防火墙注册表，保持配置顺序
#[derive(Clone, Default)]
pub struct FirewallRegistry {
    firewalls: Vec<RegisteredFirewall>,
}

impl FirewallRegistry {
    pub fn new(firewalls: Vec<RegisteredFirewall>) -> Self {
        Self { firewalls }
    }

    /// 按配置构建；引用了未知分类器的防火墙视为配置错误
    pub fn from_configs(configs: Vec<FirewallConfig>, provider: &dyn ClassifierProvider) -> Result<Self> {
        let firewalls = configs
            .into_iter()
            .map(|config| {
                let classifier = provider.classifier(&config.classifier).ok_or_else(|| {
                    AppError::Config(format!(
                        "firewall {} references unknown classifier '{}'",
                        config.id, config.classifier
                    ))
                })?;
                Ok(RegisteredFirewall { config, classifier })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            total = firewalls.len(),
            enabled = firewalls.iter().filter(|f| f.config.enabled).count(),
            "Firewall registry loaded"
        );

        Ok(Self { firewalls })
    }

    pub fn from_settings(settings: &[FirewallSettings], provider: &dyn ClassifierProvider) -> Result<Self> {
        let configs = settings
            .iter()
            .map(FirewallConfig::from_settings)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| AppError::Config(e.to_string()))?;
        Self::from_configs(configs, provider)
    }

    /// 已启用的防火墙，按配置顺序
    pub fn enabled(&self) -> impl Iterator<Item = &RegisteredFirewall> {
        self.firewalls.iter().filter(|f| f.config.enabled)
    }

    pub fn all(&self) -> &[RegisteredFirewall] {
        &self.firewalls
    }

    pub fn len(&self) -> usize {
        self.firewalls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.firewalls.is_empty()
    }
}
