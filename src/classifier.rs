//! 分类器能力
//! 防火墙只依赖 `classify(text) -> score`，模型调用本身由外部实现

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// 分类器调用失败
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier unreachable: {0}")]
    Unreachable(String),

    #[error("classifier timed out")]
    Timeout,

    #[error("malformed classifier response: {0}")]
    Malformed(String),
}

/// 把文本映射为 [0, 1] 风险分值的能力
#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, text: &str) -> Result<f64, ClassifierError>;
}

/// 按引用名查找分类器
pub trait ClassifierProvider: Send + Sync {
    fn classifier(&self, reference: &str) -> Option<Arc<dyn Classifier>>;
}

/// 基于名称表的分类器集合
#[derive(Default, Clone)]
pub struct ClassifierSet {
    classifiers: HashMap<String, Arc<dyn Classifier>>,
}

impl ClassifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, classifier: Arc<dyn Classifier>) {
        self.classifiers.insert(classifier.name().to_string(), classifier);
    }

    /// 由本地模式分类器配置构建
    pub fn from_settings(settings: &[PatternClassifierSettings]) -> Result<Self, regex::Error> {
        let mut set = Self::new();
        for entry in settings {
            set.register(Arc::new(PatternClassifier::from_settings(entry)?));
        }
        Ok(set)
    }

    pub fn with(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.register(classifier);
        self
    }

    pub fn len(&self) -> usize {
        self.classifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classifiers.is_empty()
    }
}

impl ClassifierProvider for ClassifierSet {
    fn classifier(&self, reference: &str) -> Option<Arc<dyn Classifier>> {
        self.classifiers.get(reference).cloned()
    }
}

/// 本地模式分类器配置
#[derive(Debug, Clone, Deserialize)]
pub struct PatternClassifierSettings {
    pub name: String,
    pub patterns: Vec<String>,
    /// 每命中一个模式增加的分值
    #[serde(default = "default_hit_weight")]
    pub hit_weight: f64,
}

fn default_hit_weight() -> f64 {
    1.0
}

/// 本地正则分类器：命中数乘以权重，封顶 1.0
pub struct PatternClassifier {
    name: String,
    patterns: Vec<Regex>,
    hit_weight: f64,
}

impl PatternClassifier {
    pub fn from_settings(settings: &PatternClassifierSettings) -> Result<Self, regex::Error> {
        let patterns = settings
            .patterns
            .iter()
            .map(|p| RegexBuilder::new(p).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: settings.name.clone(),
            patterns,
            hit_weight: settings.hit_weight.clamp(0.0, 1.0),
        })
    }
}

#[async_trait]
impl Classifier for PatternClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn classify(&self, text: &str) -> Result<f64, ClassifierError> {
        let hits = self.patterns.iter().filter(|p| p.is_match(text)).count();
        Ok((hits as f64 * self.hit_weight).min(1.0))
    }
}
