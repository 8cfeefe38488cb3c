//! LLM 网关核心库
//! 请求校验、防火墙管道、审计存储与 Trace 重建

pub mod classifier;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod registry;
pub mod repository;
pub mod routes;
pub mod services;
pub mod telemetry;
