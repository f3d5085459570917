#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

pub mod cancel;
pub mod config;
pub mod error;
mod impls;
pub mod pool;
mod resource;
#[cfg(feature = "sim")]
pub mod sim;
mod state;

pub use crate::{
    cancel::CancelToken,
    config::{PoolConfig, Strategy},
    error::Error,
    impls::{CondPool, SemaphorePool, TokenPool},
    pool::{Pool, PoolExt, Pooled, SharedPool},
    resource::{Manager, Resource},
    state::PoolState,
};
