//! TOML config loading for the runner.
//!
//! Deserializes `configs/ssl.toml`, which has `[run]`, `[model]`,
//! `[online_eval]` and `[trainer]` sections, then merges CLI overrides.

use std::path::Path;

use selfsup::training::byol::ByolConfig;
use selfsup::training::online_evaluator::OnlineEvaluatorConfig;
use selfsup::training::simclr::SimClrConfig;
use selfsup::training::trainer::TrainerConfig;
use selfsup::SslTrainingType;
use serde::Deserialize;

/// Top-level structure matching `configs/ssl.toml`.
#[derive(Debug, Deserialize)]
pub struct SslToml {
    pub run: RunSection,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub online_eval: OnlineEvalSection,
    #[serde(default)]
    pub trainer: TrainerSection,
}

/// What to train, and on how much synthetic data.
#[derive(Debug, Deserialize)]
pub struct RunSection {
    pub ssl_type: SslTrainingType,
    #[serde(default = "default_dataset")]
    pub dataset_name: String,
    pub num_samples: usize,
    pub batch_size: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    pub num_classes: usize,
    #[serde(default = "default_val_batches")]
    pub num_val_batches: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

#[derive(Debug, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_encoder")]
    pub encoder_name: String,
    #[serde(default = "default_true")]
    pub use_7x7_first_conv_in_resnet: bool,
    #[serde(default = "default_stem_channels")]
    pub stem_channels: usize,
    pub learning_rate: Option<f64>,
    pub weight_decay: Option<f64>,
    #[serde(default = "default_warmup_epochs")]
    pub warmup_epochs: usize,
    /// SimCLR only.
    pub temperature: Option<f64>,
    /// BYOL only.
    pub initial_tau: Option<f64>,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            encoder_name: default_encoder(),
            use_7x7_first_conv_in_resnet: true,
            stem_channels: default_stem_channels(),
            learning_rate: None,
            weight_decay: None,
            warmup_epochs: default_warmup_epochs(),
            temperature: None,
            initial_tau: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OnlineEvalSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_drop_p")]
    pub drop_p: f64,
    #[serde(default = "default_eval_lr")]
    pub learning_rate: f64,
    pub hidden_dim: Option<usize>,
    pub class_weights: Option<Vec<f32>>,
}

impl Default for OnlineEvalSection {
    fn default() -> Self {
        Self {
            enabled: true,
            drop_p: default_drop_p(),
            learning_rate: default_eval_lr(),
            hidden_dim: None,
            class_weights: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TrainerSection {
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every_n_epochs: usize,
    pub checkpoint_dir: Option<String>,
}

impl Default for TrainerSection {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            checkpoint_every_n_epochs: default_checkpoint_every(),
            checkpoint_dir: None,
        }
    }
}

fn default_dataset() -> String {
    "synthetic".to_string()
}
fn default_image_size() -> usize {
    16
}
fn default_val_batches() -> usize {
    1
}
fn default_seed() -> u64 {
    42
}
fn default_encoder() -> String {
    "resnet18".to_string()
}
fn default_true() -> bool {
    true
}
fn default_stem_channels() -> usize {
    32
}
fn default_warmup_epochs() -> usize {
    10
}
fn default_drop_p() -> f64 {
    0.2
}
fn default_eval_lr() -> f64 {
    1e-4
}
fn default_max_epochs() -> usize {
    100
}
fn default_checkpoint_every() -> usize {
    1
}

/// Values that can be overridden from the command line.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub ssl_type: Option<SslTrainingType>,
    pub max_epochs: Option<usize>,
    pub checkpoint_dir: Option<String>,
}

/// Load and deserialize an `SslToml` from a TOML file.
pub fn load_ssl_toml(path: &Path) -> anyhow::Result<SslToml> {
    let contents = std::fs::read_to_string(path)?;
    let config: SslToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), ssl_type = %config.run.ssl_type, "Loaded SSL config");
    Ok(config)
}

impl SslToml {
    /// Apply CLI overrides. Priority: config defaults < TOML values < CLI flags.
    pub fn apply_overrides(&mut self, overrides: CliOverrides) {
        if let Some(ssl_type) = overrides.ssl_type {
            self.run.ssl_type = ssl_type;
        }
        if let Some(max_epochs) = overrides.max_epochs {
            self.trainer.max_epochs = max_epochs;
        }
        if overrides.checkpoint_dir.is_some() {
            self.trainer.checkpoint_dir = overrides.checkpoint_dir;
        }
    }

    pub fn simclr_config(&self) -> SimClrConfig {
        let mut config = SimClrConfig::new(
            self.model.encoder_name.clone(),
            self.run.dataset_name.clone(),
            self.run.num_samples,
            self.run.batch_size,
        )
        .with_max_epochs(self.trainer.max_epochs)
        .with_warmup_epochs(self.model.warmup_epochs)
        .with_use_7x7_first_conv_in_resnet(self.model.use_7x7_first_conv_in_resnet)
        .with_stem_channels(self.model.stem_channels);
        if let Some(lr) = self.model.learning_rate {
            config = config.with_learning_rate(lr);
        }
        if let Some(wd) = self.model.weight_decay {
            config = config.with_weight_decay(wd);
        }
        if let Some(t) = self.model.temperature {
            config = config.with_temperature(t);
        }
        config
    }

    pub fn byol_config(&self) -> ByolConfig {
        let mut config = ByolConfig::new(
            self.model.encoder_name.clone(),
            self.run.dataset_name.clone(),
            self.run.num_samples,
            self.run.batch_size,
        )
        .with_max_epochs(self.trainer.max_epochs)
        .with_warmup_epochs(self.model.warmup_epochs)
        .with_use_7x7_first_conv_in_resnet(self.model.use_7x7_first_conv_in_resnet)
        .with_stem_channels(self.model.stem_channels);
        if let Some(lr) = self.model.learning_rate {
            config = config.with_learning_rate(lr);
        }
        if let Some(wd) = self.model.weight_decay {
            config = config.with_weight_decay(wd);
        }
        if let Some(tau) = self.model.initial_tau {
            config = config.with_initial_tau(tau);
        }
        config
    }

    pub fn online_eval_config(&self, z_dim: usize) -> OnlineEvaluatorConfig {
        OnlineEvaluatorConfig::new(z_dim, self.run.num_classes, self.run.dataset_name.clone())
            .with_drop_p(self.online_eval.drop_p)
            .with_learning_rate(self.online_eval.learning_rate)
            .with_hidden_dim(self.online_eval.hidden_dim)
            .with_class_weights(self.online_eval.class_weights.clone())
    }

    pub fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig::new()
            .with_max_epochs(self.trainer.max_epochs)
            .with_checkpoint_every_n_epochs(self.trainer.checkpoint_every_n_epochs)
            .with_checkpoint_dir(self.trainer.checkpoint_dir.clone())
            .with_seed(self.run.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[run]
ssl_type = "BYOL"
num_samples = 64
batch_size = 8
num_classes = 10
"#;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let config: SslToml = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.run.ssl_type, SslTrainingType::Byol);
        assert_eq!(config.model.encoder_name, "resnet18");
        assert!(config.online_eval.enabled);
        assert_eq!(config.trainer.max_epochs, 100);
        assert_eq!(config.byol_config().train_iters_per_epoch(), 8);
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut config: SslToml = toml::from_str(MINIMAL).unwrap();
        config.apply_overrides(CliOverrides {
            ssl_type: Some(SslTrainingType::SimClr),
            max_epochs: Some(3),
            checkpoint_dir: Some("out".to_string()),
        });
        assert_eq!(config.run.ssl_type, SslTrainingType::SimClr);
        assert_eq!(config.simclr_config().max_epochs, 3);
        assert_eq!(config.trainer_config().checkpoint_dir.as_deref(), Some("out"));
    }

    #[test]
    fn test_unknown_ssl_type_is_rejected() {
        let bad = MINIMAL.replace("BYOL", "SwAV");
        assert!(toml::from_str::<SslToml>(&bad).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssl.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = load_ssl_toml(&path).unwrap();
        assert_eq!(config.run.num_classes, 10);
        assert!(load_ssl_toml(&dir.path().join("missing.toml")).is_err());
    }
}
