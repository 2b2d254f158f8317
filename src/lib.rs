#![allow(dead_code)]

pub mod commands;
pub mod config;
pub mod container;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod export;
pub mod output;
pub mod provider;
pub mod state;
pub mod target;
pub mod tools;
