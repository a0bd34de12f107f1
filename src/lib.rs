//! llamactl-core — management plane and reverse proxy for local
//! inference-engine backends.
//!
//! - Supervises per-instance subprocesses (llama.cpp / mlx_lm / vllm),
//!   health-gating and auto-restarting them.
//! - Admits on-demand starts against a bounded pool of running instances,
//!   evicting the least-recently-used idle one when at capacity.
//! - Routes OpenAI-compatible requests and raw `/proxy/{name}/*` traffic to
//!   the right backend, starting it first if needed.
//! - Reaps instances idle past their configured timeout.
//! - Persists instance definitions so the set survives restarts.

pub mod api;
pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod instance;
pub mod manager;
pub mod openai;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod reaper;
