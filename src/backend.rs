//! Backend capability table and command construction.
//!
//! `build_command` is deliberately small (§9.1): backend-flag translation
//! is not the hard part of this system. It reads only the fields the core
//! is allowed to interpret (`model`, `host`, `port`) plus the handful of
//! engine-wide knobs (`command_override`, `docker_enabled`, `environment`),
//! and passes any other `backend_options` key straight through as a long
//! flag.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::{BackendType, InstanceOptions};
use crate::error::Error;

/// How the supervisor should probe whether a backend has finished starting.
#[derive(Debug, Clone, Copy)]
pub struct HealthProbe {
    pub method: &'static str,
    pub path: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct BackendCapability {
    pub default_binary: &'static str,
    pub default_host: &'static str,
    pub health_probe: HealthProbe,
}

pub fn capability(backend_type: BackendType) -> BackendCapability {
    match backend_type {
        BackendType::LlamaCpp => BackendCapability {
            default_binary: "llama-server",
            default_host: "127.0.0.1",
            health_probe: HealthProbe {
                method: "GET",
                path: "/health",
            },
        },
        BackendType::MlxLm => BackendCapability {
            default_binary: "mlx_lm.server",
            default_host: "127.0.0.1",
            // mlx_lm's HTTP server has no dedicated health endpoint; a
            // successful response from /v1/models is the closest
            // backend-defined readiness signal it exposes.
            health_probe: HealthProbe {
                method: "GET",
                path: "/v1/models",
            },
        },
        BackendType::Vllm => BackendCapability {
            default_binary: "vllm",
            default_host: "0.0.0.0",
            health_probe: HealthProbe {
                method: "GET",
                path: "/health",
            },
        },
    }
}

/// The fully resolved argv/env/working_dir a subprocess should be spawned
/// with. Produced by a pure function so it's testable without touching a
/// real process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
}

pub fn build_command(
    name: &str,
    options: &InstanceOptions,
    port: u16,
    data_dir: &Path,
) -> Result<BuiltCommand, Error> {
    let cap = capability(options.backend_type);
    let host = options
        .backend_options
        .host
        .clone()
        .unwrap_or_else(|| cap.default_host.to_string());

    let mut args: Vec<String> = Vec::new();
    let mut program = options
        .command_override
        .clone()
        .unwrap_or_else(|| cap.default_binary.to_string());

    if let Some(model) = &options.backend_options.model {
        args.push("--model".into());
        args.push(model.clone());
    }
    args.push("--host".into());
    args.push(host);
    args.push("--port".into());
    args.push(port.to_string());

    for (key, value) in &options.backend_options.extra {
        args.push(format!("--{key}"));
        args.push(value_to_flag_arg(value));
    }

    if options.docker_enabled {
        let mut wrapped = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            format!("llamactl-{name}"),
            "-p".to_string(),
            format!("{port}:{port}"),
            program,
        ];
        wrapped.extend(args);
        program = "docker".to_string();
        args = wrapped;
    }

    let mut env: Vec<(String, String)> = options
        .environment
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.sort();

    let working_dir = data_dir.join(name);

    Ok(BuiltCommand {
        program,
        args,
        env,
        working_dir,
    })
}

fn value_to_flag_arg(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Builds the environment map passed to a spawned subprocess: the
/// instance's own `options.environment` plus a generated opaque API key
/// (§4.8), with the options map taking precedence if it already sets the
/// same key.
pub fn build_environment(options: &InstanceOptions, api_key: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("LLAMACTL_API_KEY".to_string(), api_key.to_string());
    env.extend(options.environment.clone());
    env
}
