//! Model configuration: an immutable, versioned set of hyperparameters.
//!
//! A [`ModelConfig`] is never edited in place by the lifecycle code. Every
//! change goes through [`ModelConfig::revise`], which hands back a new value
//! with a bumped version, so a training run always sees the exact snapshot it
//! was started with.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{Error, Result};

/// Declares a closed set of named choices that round-trips through strings.
///
/// The first name of each variant is canonical; the rest are accepted aliases.
/// Matching is case-insensitive.
macro_rules! named_choice {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => [$canonical:literal $(, $alias:literal)*] ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $canonical ),+
                }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let needle = s.trim().to_lowercase();
                $(
                    if needle == $canonical.to_lowercase() $(|| needle == $alias)* {
                        return Ok($name::$variant);
                    }
                )+
                Err(Error::InvalidConfig(format!(
                    "unknown {} '{}'",
                    stringify!($name),
                    s
                )))
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

named_choice! {
    /// Which network the builder synthesizes.
    ArchitectureKind {
        /// Dense regressor over the numeric features only.
        Numeric => ["Numeric", "dense"],
        /// Convolutional image branch fused with the numeric branch.
        ImageFusion => ["ImageFusion", "cnn+dense", "fusion"],
    }
}

named_choice! {
    Activation {
        Relu => ["relu"],
        Sigmoid => ["sigmoid"],
        Tanh => ["tanh"],
        Linear => ["linear", "identity"],
    }
}

named_choice! {
    OptimizerKind {
        Adam => ["adam"],
        Sgd => ["sgd"],
        RmsProp => ["rmsprop"],
    }
}

named_choice! {
    LossKind {
        Mse => ["mean_squared_error", "mse"],
        Mae => ["mae", "mean_absolute_error"],
        Huber => ["huber", "huber_loss"],
    }
}

named_choice! {
    WeightInit {
        GlorotUniform => ["glorot_uniform", "xavier_uniform"],
        HeNormal => ["he_normal", "kaiming_normal"],
        HeUniform => ["he_uniform", "kaiming_uniform"],
        RandomNormal => ["random_normal", "normal"],
    }
}

named_choice! {
    /// Metrics reported alongside the loss during training.
    MetricKind {
        Mae => ["mae", "mean_absolute_error"],
        Mse => ["mean_squared_error", "mse"],
        Rmse => ["rmse", "root_mean_squared_error"],
    }
}

const DEFAULT_HIDDEN_LAYERS: &str = "64,64";
const DEFAULT_CNN_FILTERS: &str = "32,64";
const DEFAULT_KERNEL: [usize; 2] = [3, 3];
const DEFAULT_POOL: [usize; 2] = [2, 2];
const DEFAULT_METRICS: &str = "mae,mean_squared_error";

/// Hyperparameters of one model.
///
/// Keys mirror the exported JSON document. Keys this version does not know
/// land in `extra`, survive export, and are never read by the builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Display label of the configuration
    pub label: String,
    /// Incremented by every revision
    pub version: u32,
    pub n_epochs: usize,
    pub batch_size: usize,
    pub architecture: ArchitectureKind,
    /// Comma-separated widths of the dense trunk
    pub hidden_layers: String,
    pub activation: Activation,
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub loss: LossKind,
    /// Comma-separated metric names
    pub metrics: String,
    pub weight_init: WeightInit,
    pub use_dropout: bool,
    pub dropout_rate: f64,
    /// L2 penalty, applied as optimizer weight decay
    pub l2_reg: f64,
    /// Comma-separated filter counts, one conv stage each
    pub cnn_filters: String,
    pub cnn_kernel_size: String,
    pub cnn_pool_size: String,
    /// Times the whole `cnn_filters` sequence is repeated after the first pass
    pub cnn_additional_layers: usize,
    pub use_batch_norm: bool,
    pub fine_tuning: bool,
    /// Trailing conv stages left trainable while fine-tuning
    pub fine_tuning_layers: usize,
    pub use_augmentation: bool,
    /// Keep and restore the lowest-loss epoch snapshot
    pub use_checkpoints: bool,
    /// Seed for cross-validation fold shuffling
    pub cv_seed: u64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            label: "default".to_string(),
            version: 1,
            n_epochs: 10,
            batch_size: 32,
            architecture: ArchitectureKind::Numeric,
            hidden_layers: DEFAULT_HIDDEN_LAYERS.to_string(),
            activation: Activation::Relu,
            optimizer: OptimizerKind::Adam,
            learning_rate: 0.001,
            loss: LossKind::Mse,
            metrics: DEFAULT_METRICS.to_string(),
            weight_init: WeightInit::GlorotUniform,
            use_dropout: false,
            dropout_rate: 0.0,
            l2_reg: 0.0,
            cnn_filters: DEFAULT_CNN_FILTERS.to_string(),
            cnn_kernel_size: "3,3".to_string(),
            cnn_pool_size: "2,2".to_string(),
            cnn_additional_layers: 0,
            use_batch_norm: false,
            fine_tuning: false,
            fine_tuning_layers: 0,
            use_augmentation: false,
            use_checkpoints: true,
            cv_seed: 42,
            extra: BTreeMap::new(),
        }
    }
}

/// Outcome of importing a configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Keys kept verbatim in `extra`
    pub unknown: Vec<String>,
    /// Known keys whose value could not be used; defaults were kept
    pub rejected: Vec<String>,
}

impl ImportReport {
    pub fn is_clean(&self) -> bool {
        self.unknown.is_empty() && self.rejected.is_empty()
    }
}

/// Every field that changes the shape of the built network.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchitectureSignature {
    pub kind: ArchitectureKind,
    pub hidden_units: Vec<usize>,
    pub activation: Activation,
    pub weight_init: WeightInit,
    pub dropout: Option<f64>,
    pub batch_norm: bool,
    pub conv_filters: Vec<usize>,
    pub kernel_size: [usize; 2],
    pub pool_size: [usize; 2],
    pub additional_conv_stages: usize,
}

impl ModelConfig {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Returns an edited copy with the version bumped.
    pub fn revise(&self, edit: impl FnOnce(&mut ModelConfig)) -> ModelConfig {
        let mut next = self.clone();
        edit(&mut next);
        next.version = self.version + 1;
        next
    }

    /// Widths of the dense trunk.
    pub fn hidden_units(&self) -> Vec<usize> {
        parse_list("hidden_layers", &self.hidden_layers, DEFAULT_HIDDEN_LAYERS)
    }

    /// One filter count per base conv stage.
    pub fn conv_filters(&self) -> Vec<usize> {
        parse_list("cnn_filters", &self.cnn_filters, DEFAULT_CNN_FILTERS)
    }

    /// Convolution kernel; even sizes fall back to the default.
    pub fn kernel_size(&self) -> [usize; 2] {
        let kernel = parse_pair("cnn_kernel_size", &self.cnn_kernel_size, DEFAULT_KERNEL);
        if kernel.iter().any(|k| k % 2 == 0) {
            warn!(
                value = %self.cnn_kernel_size,
                "same-padding convolutions need odd kernel sizes, using {:?}",
                DEFAULT_KERNEL
            );
            return DEFAULT_KERNEL;
        }
        kernel
    }

    pub fn pool_size(&self) -> [usize; 2] {
        parse_pair("cnn_pool_size", &self.cnn_pool_size, DEFAULT_POOL)
    }

    /// Configured metrics; unknown names are skipped.
    pub fn metric_kinds(&self) -> Vec<MetricKind> {
        let kinds: Vec<MetricKind> = split_items(&self.metrics)
            .filter_map(|name| match name.parse() {
                Ok(kind) => Some(kind),
                Err(err) => {
                    warn!(metric = name, "{err}, skipping");
                    None
                }
            })
            .collect();
        if kinds.is_empty() {
            warn!(value = %self.metrics, "no usable metric, using '{DEFAULT_METRICS}'");
            return vec![MetricKind::Mae, MetricKind::Mse];
        }
        kinds
    }

    /// Dropout probability when dropout is switched on and non-zero.
    pub fn effective_dropout(&self) -> Option<f64> {
        (self.use_dropout && self.dropout_rate > 0.0).then(|| self.dropout_rate.clamp(0.0, 1.0))
    }

    pub fn weight_decay(&self) -> Option<f64> {
        (self.l2_reg > 0.0).then_some(self.l2_reg)
    }

    pub fn architecture_signature(&self) -> ArchitectureSignature {
        ArchitectureSignature {
            kind: self.architecture,
            hidden_units: self.hidden_units(),
            activation: self.activation,
            weight_init: self.weight_init,
            dropout: self.effective_dropout(),
            batch_norm: self.use_batch_norm,
            conv_filters: self.conv_filters(),
            kernel_size: self.kernel_size(),
            pool_size: self.pool_size(),
            additional_conv_stages: self.cnn_additional_layers,
        }
    }

    /// Checks value ranges and reports every violation at once.
    pub fn validate(&self) -> Result<()> {
        let issues = self.issues();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfig(issues.join("; ")))
        }
    }

    /// Copy with every out-of-range value replaced by its default.
    pub fn sanitized(&self) -> ModelConfig {
        let defaults = ModelConfig::default();
        let mut fixed = self.clone();
        for issue in self.issues() {
            warn!("{issue}, falling back to default");
        }
        if fixed.n_epochs == 0 {
            fixed.n_epochs = defaults.n_epochs;
        }
        if fixed.batch_size == 0 {
            fixed.batch_size = defaults.batch_size;
        }
        if !(0.0..=1.0).contains(&fixed.dropout_rate) {
            fixed.dropout_rate = defaults.dropout_rate;
        }
        if fixed.l2_reg.is_nan() || fixed.l2_reg < 0.0 {
            fixed.l2_reg = defaults.l2_reg;
        }
        if fixed.learning_rate.is_nan() || fixed.learning_rate <= 0.0 {
            fixed.learning_rate = defaults.learning_rate;
        }
        if split_items(&fixed.metrics).next().is_none() {
            fixed.metrics = defaults.metrics;
        }
        fixed
    }

    fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.n_epochs == 0 {
            issues.push("n_epochs must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            issues.push("batch_size must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.dropout_rate) {
            issues.push(format!("dropout_rate {} is outside [0, 1]", self.dropout_rate));
        }
        if self.l2_reg.is_nan() || self.l2_reg < 0.0 {
            issues.push(format!("l2_reg {} must be non-negative", self.l2_reg));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            issues.push(format!("learning_rate {} must be positive", self.learning_rate));
        }
        if split_items(&self.metrics).next().is_none() {
            issues.push("metrics must name at least one metric".to_string());
        }
        issues
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Imports a JSON document, tolerating unknown, missing and mistyped keys.
    pub fn from_json(text: &str) -> Result<(Self, ImportReport)> {
        let document: Value = serde_json::from_str(text)?;
        match document {
            Value::Object(map) => Self::from_map(map),
            other => Err(Error::InvalidConfig(format!(
                "config document must be a JSON object, found {}",
                json_type(&other)
            ))),
        }
    }

    fn from_map(map: Map<String, Value>) -> Result<(Self, ImportReport)> {
        let known = Self::known_keys()?;
        let mut accepted = Map::new();
        let mut report = ImportReport::default();

        for (key, value) in map {
            if !known.contains(&key) {
                report.unknown.push(key.clone());
                accepted.insert(key, value);
                continue;
            }
            let mut candidate = accepted.clone();
            candidate.insert(key.clone(), value);
            match serde_json::from_value::<ModelConfig>(Value::Object(candidate.clone())) {
                Ok(_) => accepted = candidate,
                Err(err) => {
                    warn!(key = %key, error = %err, "rejected config value, keeping default");
                    report.rejected.push(key);
                }
            }
        }

        let config = serde_json::from_value(Value::Object(accepted))?;
        Ok((config, report))
    }

    fn known_keys() -> Result<Vec<String>> {
        match serde_json::to_value(ModelConfig::default())? {
            Value::Object(map) => Ok(map.into_iter().map(|(k, _)| k).collect()),
            _ => Err(Error::Serialization(
                "model config did not serialize to an object".to_string(),
            )),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<(Self, ImportReport)> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

fn split_items(text: &str) -> impl Iterator<Item = &str> {
    text.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Keeps the positive integers of a comma list; an unusable list yields `default`.
fn parse_list(field: &str, text: &str, default: &str) -> Vec<usize> {
    let mut values = Vec::new();
    for item in split_items(text) {
        match item.parse::<usize>() {
            Ok(v) if v > 0 => values.push(v),
            _ => warn!(field, item, "ignoring malformed list entry"),
        }
    }
    if values.is_empty() {
        warn!(field, value = text, "no usable entries, using '{default}'");
        return split_items(default)
            .filter_map(|item| item.parse().ok())
            .collect();
    }
    values
}

/// Parses `"h,w"` (or a single side) into a pair.
fn parse_pair(field: &str, text: &str, default: [usize; 2]) -> [usize; 2] {
    let values: Option<Vec<usize>> = split_items(text)
        .map(|item| item.parse::<usize>().ok().filter(|v| *v > 0))
        .collect();
    match values.as_deref() {
        Some([side]) => [*side, *side],
        Some([h, w]) => [*h, *w],
        _ => {
            warn!(field, value = text, "malformed size, using {:?}", default);
            default
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
