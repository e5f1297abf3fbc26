//! Closed tag enumerations used by batches, checkpoints and configs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TrainingError;

/// Which consumer a keyed sub-batch is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SslDataModuleType {
    /// Augmented view pairs for the encoder objective.
    #[serde(rename = "encoder")]
    Encoder,
    /// Labelled views for the online linear head.
    #[serde(rename = "linear_head")]
    LinearHead,
}

impl SslDataModuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslDataModuleType::Encoder => "encoder",
            SslDataModuleType::LinearHead => "linear_head",
        }
    }
}

impl fmt::Display for SslDataModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SslDataModuleType {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "encoder" => Ok(SslDataModuleType::Encoder),
            "linear_head" => Ok(SslDataModuleType::LinearHead),
            other => Err(TrainingError::UnknownDataModuleType(other.to_string())),
        }
    }
}

/// Self-supervised objective recorded in every checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SslTrainingType {
    #[serde(rename = "SimCLR")]
    SimClr,
    #[serde(rename = "BYOL")]
    Byol,
}

impl SslTrainingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslTrainingType::SimClr => "SimCLR",
            SslTrainingType::Byol => "BYOL",
        }
    }
}

impl fmt::Display for SslTrainingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SslTrainingType {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SimCLR" => Ok(SslTrainingType::SimClr),
            "BYOL" => Ok(SslTrainingType::Byol),
            other => Err(TrainingError::UnknownSslType(other.to_string())),
        }
    }
}
