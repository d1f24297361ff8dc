//! Backend command construction.
//!
//! Each backend family maps a typed flag record onto the argv used to spawn
//! the upstream inference server. Building is pure: the same options always
//! produce the same argv, in the same order.

use serde::{Deserialize, Serialize};

/// Backend family of an instance's upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    LlamaCpp,
    MlxLm,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::LlamaCpp => write!(f, "llama_cpp"),
            BackendKind::MlxLm => write!(f, "mlx_lm"),
        }
    }
}

/// Backend selection plus the backend-specific flag record.
///
/// ```json
/// { "backend_type": "llama_cpp", "backend_options": { "model": "/models/q4.gguf" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend_type", content = "backend_options")]
pub enum BackendOptions {
    #[serde(rename = "llama_cpp")]
    LlamaCpp(LlamaServerOptions),
    #[serde(rename = "mlx_lm")]
    MlxLm(MlxServerOptions),
}

impl BackendOptions {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendOptions::LlamaCpp(_) => BackendKind::LlamaCpp,
            BackendOptions::MlxLm(_) => BackendKind::MlxLm,
        }
    }

    /// Build the argv for the upstream server.
    ///
    /// `host` and `port` come from the instance options so the child listens
    /// exactly where the reverse proxy will target.
    pub fn build_args(&self, host: &str, port: u16) -> Vec<String> {
        let mut args = vec![
            "--host".to_string(),
            host.to_string(),
            "--port".to_string(),
            port.to_string(),
        ];

        match self {
            BackendOptions::LlamaCpp(opts) => opts.append_args(&mut args),
            BackendOptions::MlxLm(opts) => opts.append_args(&mut args),
        }

        args
    }
}

/// Flags for `llama-server` (llama.cpp).
///
/// Absent fields emit no flag; booleans emit the bare flag when true;
/// `lora` repeats its flag once per adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlamaServerOptions {
    pub model: Option<String>,
    pub ctx_size: Option<u32>,
    pub n_gpu_layers: Option<i32>,
    pub threads: Option<u32>,
    pub batch_size: Option<u32>,
    pub parallel: Option<u32>,
    pub seed: Option<i64>,
    pub flash_attn: bool,
    pub embedding: bool,
    pub mlock: bool,
    pub no_mmap: bool,
    pub api_key: Option<String>,
    pub chat_template: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub lora: Vec<String>,
    /// Additional CLI arguments passed through verbatim, after all typed flags
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl LlamaServerOptions {
    fn append_args(&self, args: &mut Vec<String>) {
        push_value(args, "--model", self.model.as_ref());
        push_value(args, "--ctx-size", self.ctx_size.as_ref());
        push_value(args, "--n-gpu-layers", self.n_gpu_layers.as_ref());
        push_value(args, "--threads", self.threads.as_ref());
        push_value(args, "--batch-size", self.batch_size.as_ref());
        push_value(args, "--parallel", self.parallel.as_ref());
        push_value(args, "--seed", self.seed.as_ref());
        push_flag(args, "--flash-attn", self.flash_attn);
        push_flag(args, "--embedding", self.embedding);
        push_flag(args, "--mlock", self.mlock);
        push_flag(args, "--no-mmap", self.no_mmap);
        push_value(args, "--api-key", self.api_key.as_ref());
        push_value(args, "--chat-template", self.chat_template.as_ref());
        push_repeated(args, "--lora", &self.lora);
        args.extend(self.extra_args.iter().cloned());
    }
}

/// Flags for `mlx_lm.server`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlxServerOptions {
    pub model: Option<String>,
    pub adapter_path: Option<String>,
    pub draft_model: Option<String>,
    pub num_draft_tokens: Option<u32>,
    pub trust_remote_code: bool,
    pub log_level: Option<String>,
    pub chat_template: Option<String>,
    pub max_tokens: Option<u32>,
    /// Additional CLI arguments passed through verbatim, after all typed flags
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl MlxServerOptions {
    fn append_args(&self, args: &mut Vec<String>) {
        push_value(args, "--model", self.model.as_ref());
        push_value(args, "--adapter-path", self.adapter_path.as_ref());
        push_value(args, "--draft-model", self.draft_model.as_ref());
        push_value(args, "--num-draft-tokens", self.num_draft_tokens.as_ref());
        push_flag(args, "--trust-remote-code", self.trust_remote_code);
        push_value(args, "--log-level", self.log_level.as_ref());
        push_value(args, "--chat-template", self.chat_template.as_ref());
        push_value(args, "--max-tokens", self.max_tokens.as_ref());
        args.extend(self.extra_args.iter().cloned());
    }
}

fn push_value<T: ToString>(args: &mut Vec<String>, flag: &str, value: Option<&T>) {
    if let Some(v) = value {
        args.push(flag.to_string());
        args.push(v.to_string());
    }
}

fn push_flag(args: &mut Vec<String>, flag: &str, enabled: bool) {
    if enabled {
        args.push(flag.to_string());
    }
}

fn push_repeated(args: &mut Vec<String>, flag: &str, values: &[String]) {
    for v in values {
        args.push(flag.to_string());
        args.push(v.clone());
    }
}
