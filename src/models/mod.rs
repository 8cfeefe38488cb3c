//! 数据模型模块
//! 入站负载校验、防火墙策略与评估结果、审计记录与 Trace 视图

pub mod audit;
pub mod firewall;
pub mod payload;
