//! Server configuration: JSON file first, then CLI flags / env vars on top.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use disco_detect::{DetectParams, FaceParams};
use disco_model::ModelSpec;
use serde::{Deserialize, Serialize};

/// Built-in face detector layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceDetectorKind {
    /// Separate class / objectness / bbox heads per stride.
    #[default]
    MultiHead,
    /// One `[1, N, 14]` tensor.
    Dense,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Object detector weights.
    pub model_path: PathBuf,
    /// Optional JSON [`ModelSpec`] replacing the YOLOv8 preset.
    pub model_spec: Option<PathBuf>,

    pub face_detector_path: Option<PathBuf>,
    pub face_detector_kind: FaceDetectorKind,
    pub face_input_size: u32,
    pub face_detector_spec: Option<PathBuf>,

    pub face_embedder_path: Option<PathBuf>,
    pub face_embedder_spec: Option<PathBuf>,

    pub detect: DetectParams,
    pub face: FaceParams,

    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// Per-inference deadline.
    pub deadline_ms: u64,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            model_path: PathBuf::from("../models/yolov8n.onnx"),
            model_spec: None,
            face_detector_path: None,
            face_detector_kind: FaceDetectorKind::default(),
            face_input_size: 640,
            face_detector_spec: None,
            face_embedder_path: None,
            face_embedder_spec: None,
            detect: DetectParams::default(),
            face: FaceParams::default(),
            intra_threads: num_cpus::get(),
            deadline_ms: 5_000,
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn object_spec(&self) -> Result<ModelSpec> {
        match &self.model_spec {
            Some(path) => Ok(ModelSpec::from_path(path)?),
            None => Ok(ModelSpec::yolov8(640)),
        }
    }

    pub fn face_detector_spec(&self) -> Result<ModelSpec> {
        if let Some(path) = &self.face_detector_spec {
            return Ok(ModelSpec::from_path(path)?);
        }
        Ok(match self.face_detector_kind {
            FaceDetectorKind::MultiHead => ModelSpec::face_multi_head(self.face_input_size),
            FaceDetectorKind::Dense => ModelSpec::face_dense(),
        })
    }

    pub fn face_embedder_spec(&self) -> Result<ModelSpec> {
        match &self.face_embedder_spec {
            Some(path) => Ok(ModelSpec::from_path(path)?),
            None => Ok(ModelSpec::face_embedder()),
        }
    }
}

/// Accepts `8080` as well as `:8080`.
fn parse_port(s: &str) -> std::result::Result<u16, String> {
    s.trim_start_matches(':')
        .parse()
        .map_err(|e| format!("invalid port `{s}`: {e}"))
}

#[derive(Debug, Default, Parser)]
#[command(name = "disco-server", version, about = "Edge inference server for object and face pipelines")]
pub struct Cli {
    /// JSON config file; flags below override it.
    #[arg(long, env = "DISCO_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    #[arg(long, env = "PORT", value_parser = parse_port)]
    pub port: Option<u16>,

    #[arg(long, env = "MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    #[arg(long, env = "FACE_DETECTOR_PATH")]
    pub face_detector_path: Option<PathBuf>,

    #[arg(long, env = "FACE_EMBEDDER_PATH")]
    pub face_embedder_path: Option<PathBuf>,

    #[arg(long, env = "DISCO_INTRA_THREADS")]
    pub intra_threads: Option<usize>,

    #[arg(long, env = "DISCO_DEADLINE_MS")]
    pub deadline_ms: Option<u64>,
}

impl Cli {
    pub fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_path(path)?,
            None => ServerConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(self, config: &mut ServerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = self.model_path {
            config.model_path = path;
        }
        if let Some(path) = self.face_detector_path {
            config.face_detector_path = Some(path);
        }
        if let Some(path) = self.face_embedder_path {
            config.face_embedder_path = Some(path);
        }
        if let Some(n) = self.intra_threads {
            config.intra_threads = n;
        }
        if let Some(ms) = self.deadline_ms {
            config.deadline_ms = ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_edge_service() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.model_path, PathBuf::from("../models/yolov8n.onnx"));
        assert_eq!(config.face.conf_threshold, 0.6);
        assert_eq!(config.face.iou_threshold, 0.4);
        assert_eq!(config.detect.iou_threshold, None);
        assert_eq!(config.addr().unwrap().port(), 8080);
    }

    #[test]
    fn port_accepts_leading_colon() {
        assert_eq!(parse_port(":9000"), Ok(9000));
        assert_eq!(parse_port("9001"), Ok(9001));
        assert!(parse_port("http").is_err());
    }

    #[test]
    fn flags_override_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disco.json");
        std::fs::write(
            &path,
            r#"{ "port": 7000, "model_path": "a.onnx", "face": { "conf_threshold": 0.8 } }"#,
        )
        .unwrap();

        let cli = Cli {
            config: Some(path),
            model_path: Some(PathBuf::from("b.onnx")),
            ..Cli::default()
        };
        let config = cli.into_config().unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.model_path, PathBuf::from("b.onnx"));
        assert_eq!(config.face.conf_threshold, 0.8);
        assert_eq!(config.face.iou_threshold, 0.4);
    }

    #[test]
    fn face_spec_follows_kind() {
        let mut config = ServerConfig {
            face_detector_kind: FaceDetectorKind::Dense,
            ..ServerConfig::default()
        };
        assert_eq!(config.face_detector_spec().unwrap(), ModelSpec::face_dense());

        config.face_detector_kind = FaceDetectorKind::MultiHead;
        config.face_input_size = 320;
        assert_eq!(
            config.face_detector_spec().unwrap(),
            ModelSpec::face_multi_head(320)
        );
    }

    #[test]
    fn broken_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ port: ").unwrap();
        assert!(ServerConfig::from_path(&path).is_err());
    }
}
