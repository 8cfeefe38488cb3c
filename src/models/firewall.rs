//! Firewall domain models

use crate::config::FirewallSettings;
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 分类器失败时 fail-closed 记录的拦截原因
pub const EVALUATION_ERROR_REASON: &str = "firewall evaluation error";

/// 策略类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallType {
    MaliciousIntent,
    HateSpeech,
    PromptInjection,
    SelfHarm,
    Violence,
    SexualContent,
    PersonalData,
}

impl FirewallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallType::MaliciousIntent => "malicious_intent",
            FirewallType::HateSpeech => "hate_speech",
            FirewallType::PromptInjection => "prompt_injection",
            FirewallType::SelfHarm => "self_harm",
            FirewallType::Violence => "violence",
            FirewallType::SexualContent => "sexual_content",
            FirewallType::PersonalData => "personal_data",
        }
    }
}

impl FromStr for FirewallType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "malicious_intent" => Ok(FirewallType::MaliciousIntent),
            "hate_speech" => Ok(FirewallType::HateSpeech),
            "prompt_injection" => Ok(FirewallType::PromptInjection),
            "self_harm" => Ok(FirewallType::SelfHarm),
            "violence" => Ok(FirewallType::Violence),
            "sexual_content" => Ok(FirewallType::SexualContent),
            "personal_data" => Ok(FirewallType::PersonalData),
            other => Err(AppError::validation(format!("unknown firewall type '{}'", other))),
        }
    }
}

impl fmt::Display for FirewallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 分类器给出的风险分值，取值 [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct RiskScore(f64);

impl RiskScore {
    pub const MAX: RiskScore = RiskScore(1.0);

    pub fn new(value: f64) -> Result<Self> {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(AppError::validation(format!(
                "risk score must be within [0, 1], got {}",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

/// 拦截阈值，取值 [0, 1]；分值达到阈值即拦截
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BlockingThreshold(f64);

impl BlockingThreshold {
    pub fn new(value: f64) -> Result<Self> {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(AppError::validation(format!(
                "blocking threshold must be within [0, 1], got {}",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> f64 {
        self.0
    }

    pub fn is_exceeded_by(self, score: RiskScore) -> bool {
        score.get() >= self.0
    }
}

/// 一个已配置的防火墙策略（启动时加载，运行期不可变）
#[derive(Debug, Clone, PartialEq)]
pub struct FirewallConfig {
    pub id: String,
    pub enabled: bool,
    pub kind: FirewallType,
    /// 后端分类器引用
    pub classifier: String,
    pub threshold: BlockingThreshold,
}

impl FirewallConfig {
    pub fn from_settings(settings: &FirewallSettings) -> Result<Self> {
        let kind = settings.kind.parse::<FirewallType>()?;
        let classifier = settings.model.trim();
        if classifier.is_empty() {
            return Err(AppError::validation(format!(
                "firewall {} has no classifier reference",
                settings.resolved_id()
            )));
        }
        Ok(Self {
            id: settings.resolved_id(),
            enabled: settings.enabled,
            kind,
            classifier: classifier.to_string(),
            threshold: BlockingThreshold::new(settings.blocking_threshold)?,
        })
    }
}

/// 单个防火墙对一条消息的评估结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirewallAssessment {
    pub firewall_id: String,
    pub firewall_type: FirewallType,
    pub blocked: bool,
    pub blocked_reason: String,
    pub risk_score: RiskScore,
    pub evaluated_at: DateTime<Utc>,
    /// fail-closed 时的分类器错误，只用于日志，不对外输出
    #[serde(skip)]
    pub error: Option<String>,
}

impl FirewallAssessment {
    /// 按阈值判定
    pub fn from_score(config: &FirewallConfig, score: RiskScore, at: DateTime<Utc>) -> Self {
        let blocked = config.threshold.is_exceeded_by(score);
        let blocked_reason = if blocked {
            format!(
                "{} risk {:.2} reached threshold {:.2}",
                config.kind,
                score.get(),
                config.threshold.get()
            )
        } else {
            String::new()
        };
        Self {
            firewall_id: config.id.clone(),
            firewall_type: config.kind,
            blocked,
            blocked_reason,
            risk_score: score,
            evaluated_at: at,
            error: None,
        }
    }

    /// 分类器失败：按拦截处理
    pub fn fail_closed(config: &FirewallConfig, error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            firewall_id: config.id.clone(),
            firewall_type: config.kind,
            blocked: true,
            blocked_reason: EVALUATION_ERROR_REASON.to_string(),
            risk_score: RiskScore::MAX,
            evaluated_at: at,
            error: Some(error.into()),
        }
    }

    pub fn is_fail_closed(&self) -> bool {
        self.error.is_some()
    }
}

/// 聚合拦截决策
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirewallDecision {
    pub blocked: bool,
    pub reason: Option<String>,
}

impl FirewallDecision {
    pub fn allow() -> Self {
        Self {
            blocked: false,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
        }
    }

    /// 逻辑或聚合，原因按评估顺序拼接
    pub fn aggregate(assessments: &[FirewallAssessment]) -> Self {
        let reasons: Vec<String> = assessments
            .iter()
            .filter(|a| a.blocked)
            .map(|a| format!("{}: {}", a.firewall_id, a.blocked_reason))
            .collect();

        if reasons.is_empty() {
            Self::allow()
        } else {
            Self::deny(reasons.join("; "))
        }
    }
}
