//! HTTP 处理器模块

pub mod admission;
pub mod health;
pub mod trace;
