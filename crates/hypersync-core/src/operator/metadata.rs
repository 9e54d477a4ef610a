//! Operator identity and metadata loaded from a spec pack.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

/// Tag or flag advertising that an operator ships a conformance suite.
pub const CONFORMANCE_MARKER: &str = "conformance";

/// Validated operator identifier, e.g. `op://sinkhorn_entropic.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperatorId(String);

impl OperatorId {
    pub const SCHEME: &'static str = "op://";

    /// Parse and validate an operator id.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidOperatorId {
            id: raw.to_string(),
            reason: reason.to_string(),
        };

        let name = raw
            .strip_prefix(Self::SCHEME)
            .ok_or_else(|| invalid("must start with op://"))?;
        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id without its `op://` scheme.
    pub fn name(&self) -> &str {
        &self.0[Self::SCHEME.len()..]
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OperatorId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OperatorId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OperatorId> for String {
    fn from(id: OperatorId) -> Self {
        id.0
    }
}

impl Borrow<str> for OperatorId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Reproducibility class of an operator.
///
/// - `D0`: bit-exact reproducible
/// - `D1`: same distribution given the same seed
/// - `D2`: non-deterministic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeterminismTier {
    D0,
    D1,
    D2,
}

impl DeterminismTier {
    /// Whether identical inputs reproduce identical receipts.
    pub fn is_reproducible(self) -> bool {
        !matches!(self, DeterminismTier::D2)
    }
}

impl fmt::Display for DeterminismTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeterminismTier::D0 => "D0",
            DeterminismTier::D1 => "D1",
            DeterminismTier::D2 => "D2",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ParamsSection {
    #[serde(default)]
    required: Vec<String>,
}

/// On-disk shape of one operator metadata file.
#[derive(Debug, Deserialize)]
struct OperatorSpecFile {
    id: OperatorId,
    #[serde(default)]
    input_schema: Option<Value>,
    #[serde(default)]
    output_schema: Option<Value>,
    #[serde(default)]
    params: ParamsSection,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    flags: BTreeSet<String>,
    #[serde(default)]
    estimated_cost: Option<f64>,
    #[serde(default)]
    deterministic: Option<bool>,
    #[serde(default)]
    determinism_tier: Option<DeterminismTier>,
    #[serde(default)]
    deny_tiers: BTreeSet<String>,
}

/// Immutable description of a registered operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorMetadata {
    pub id: OperatorId,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub required_params: Vec<String>,
    pub tags: BTreeSet<String>,
    pub flags: BTreeSet<String>,
    pub estimated_cost: Option<f64>,
    pub deterministic: bool,
    pub determinism_tier: DeterminismTier,
    /// Policy tiers this operator refuses to run under.
    pub deny_tiers: BTreeSet<String>,
}

impl OperatorMetadata {
    /// Metadata with no schema, no requirements, and tier `D2`.
    pub fn new(id: OperatorId) -> Self {
        Self {
            id,
            input_schema: None,
            output_schema: None,
            required_params: Vec::new(),
            tags: BTreeSet::new(),
            flags: BTreeSet::new(),
            estimated_cost: None,
            deterministic: false,
            determinism_tier: DeterminismTier::D2,
            deny_tiers: BTreeSet::new(),
        }
    }

    /// Parse a metadata document in the spec-pack file format.
    pub fn from_json(value: Value) -> Result<Self, ConfigError> {
        let file: OperatorSpecFile = serde_json::from_value(value)?;
        Self::try_from(file)
    }

    pub fn with_required<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_params = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tier(mut self, tier: DeterminismTier) -> Self {
        self.determinism_tier = tier;
        self.deterministic = tier.is_reproducible();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = Some(cost);
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_deny_tier(mut self, tier: impl Into<String>) -> Self {
        self.deny_tiers.insert(tier.into());
        self
    }

    /// Whether the operator advertises a conformance suite via a tag or flag.
    pub fn has_conformance(&self) -> bool {
        self.tags.contains(CONFORMANCE_MARKER) || self.flags.contains(CONFORMANCE_MARKER)
    }
}

impl TryFrom<OperatorSpecFile> for OperatorMetadata {
    type Error = ConfigError;

    fn try_from(file: OperatorSpecFile) -> Result<Self, Self::Error> {
        let (deterministic, tier) = match (file.deterministic, file.determinism_tier) {
            (None, None) => (false, DeterminismTier::D2),
            (Some(true), None) => (true, DeterminismTier::D0),
            (Some(false), None) => (false, DeterminismTier::D2),
            (None, Some(tier)) => (tier.is_reproducible(), tier),
            (Some(flag), Some(tier)) => {
                if flag != tier.is_reproducible() {
                    return Err(ConfigError::InvalidOperator {
                        id: file.id.to_string(),
                        reason: format!("deterministic={flag} contradicts tier {tier}"),
                    });
                }
                (flag, tier)
            }
        };

        if let Some(cost) = file.estimated_cost {
            if !cost.is_finite() || cost < 0.0 {
                return Err(ConfigError::InvalidOperator {
                    id: file.id.to_string(),
                    reason: format!("estimated_cost must be a non-negative number, got {cost}"),
                });
            }
        }

        Ok(Self {
            id: file.id,
            input_schema: file.input_schema,
            output_schema: file.output_schema,
            required_params: file.params.required,
            tags: file.tags,
            flags: file.flags,
            estimated_cost: file.estimated_cost,
            deterministic,
            determinism_tier: tier,
            deny_tiers: file.deny_tiers,
        })
    }
}
