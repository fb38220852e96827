//! Model families: the cost/rate partitions requests are queued under.
//!
//! A family is an equivalence class of model IDs sharing a rate-limit and
//! pricing regime. Every inbound request is assigned exactly one family
//! ([`ModelFamily::partition`] is total), and the queue, key pool, and
//! wait-time estimator are all sharded by it.

use std::fmt;
use std::str::FromStr;

use crate::provider::ProviderKind;

/// Closed enumeration of model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    /// GPT-3.5 Turbo and anything unrecognized.
    Turbo,
    /// GPT-4 (8k context).
    Gpt4,
    /// GPT-4 32k context.
    Gpt4_32k,
    /// Anthropic Claude via the native API.
    Claude,
    /// Google PaLM text-bison.
    Bison,
    /// Claude hosted on AWS Bedrock.
    AwsClaude,
}

/// All families, in dispatch order.
pub const ALL_FAMILIES: [ModelFamily; 6] = [
    ModelFamily::Turbo,
    ModelFamily::Gpt4,
    ModelFamily::Gpt4_32k,
    ModelFamily::Claude,
    ModelFamily::Bison,
    ModelFamily::AwsClaude,
];

impl ModelFamily {
    /// Derive the family for a request.
    ///
    /// Rules, in order: requests routed to the AWS provider are always
    /// `AwsClaude` regardless of model string; otherwise the provider's
    /// dialect selects the namespace and the model prefix selects the
    /// family. Unknown models fall back to `Turbo`.
    pub fn partition(provider: ProviderKind, model: &str) -> ModelFamily {
        if provider == ProviderKind::Aws {
            return ModelFamily::AwsClaude;
        }
        match provider {
            ProviderKind::OpenAi => {
                if model.starts_with("gpt-4-32k") {
                    ModelFamily::Gpt4_32k
                } else if model.starts_with("gpt-4") {
                    ModelFamily::Gpt4
                } else {
                    ModelFamily::Turbo
                }
            }
            ProviderKind::Anthropic => {
                if model.starts_with("claude") {
                    ModelFamily::Claude
                } else {
                    ModelFamily::Turbo
                }
            }
            ProviderKind::GooglePalm => {
                if model.contains("bison") {
                    ModelFamily::Bison
                } else {
                    ModelFamily::Turbo
                }
            }
            ProviderKind::Aws => ModelFamily::AwsClaude,
        }
    }

    /// The provider whose keys serve this family.
    pub fn provider(self) -> ProviderKind {
        match self {
            ModelFamily::Turbo | ModelFamily::Gpt4 | ModelFamily::Gpt4_32k => ProviderKind::OpenAi,
            ModelFamily::Claude => ProviderKind::Anthropic,
            ModelFamily::Bison => ProviderKind::GooglePalm,
            ModelFamily::AwsClaude => ProviderKind::Aws,
        }
    }

    /// A representative model id for lockout queries against the key pool.
    pub fn representative_model(self) -> &'static str {
        match self {
            ModelFamily::Turbo => "gpt-3.5-turbo",
            ModelFamily::Gpt4 => "gpt-4",
            ModelFamily::Gpt4_32k => "gpt-4-32k",
            ModelFamily::Claude => "claude-v2",
            ModelFamily::Bison => "text-bison-001",
            ModelFamily::AwsClaude => "anthropic.claude-v2",
        }
    }

    /// Stable lowercase name, used in config allow-lists and telemetry.
    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::Turbo => "turbo",
            ModelFamily::Gpt4 => "gpt4",
            ModelFamily::Gpt4_32k => "gpt4-32k",
            ModelFamily::Claude => "claude",
            ModelFamily::Bison => "bison",
            ModelFamily::AwsClaude => "aws-claude",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "turbo" => Ok(ModelFamily::Turbo),
            "gpt4" => Ok(ModelFamily::Gpt4),
            "gpt4-32k" => Ok(ModelFamily::Gpt4_32k),
            "claude" => Ok(ModelFamily::Claude),
            "bison" => Ok(ModelFamily::Bison),
            "aws-claude" => Ok(ModelFamily::AwsClaude),
            other => Err(format!("unknown model family: '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_openai_prefixes() {
        assert_eq!(
            ModelFamily::partition(ProviderKind::OpenAi, "gpt-3.5-turbo"),
            ModelFamily::Turbo
        );
        assert_eq!(
            ModelFamily::partition(ProviderKind::OpenAi, "gpt-4"),
            ModelFamily::Gpt4
        );
        assert_eq!(
            ModelFamily::partition(ProviderKind::OpenAi, "gpt-4-0613"),
            ModelFamily::Gpt4
        );
        assert_eq!(
            ModelFamily::partition(ProviderKind::OpenAi, "gpt-4-32k-0613"),
            ModelFamily::Gpt4_32k
        );
    }

    #[test]
    fn test_partition_unknown_falls_back_to_turbo() {
        assert_eq!(
            ModelFamily::partition(ProviderKind::OpenAi, "davinci-002"),
            ModelFamily::Turbo
        );
        assert_eq!(
            ModelFamily::partition(ProviderKind::Anthropic, "mystery-model"),
            ModelFamily::Turbo
        );
    }

    #[test]
    fn test_partition_aws_overrides_model_string() {
        assert_eq!(
            ModelFamily::partition(ProviderKind::Aws, "gpt-4"),
            ModelFamily::AwsClaude
        );
        assert_eq!(
            ModelFamily::partition(ProviderKind::Aws, "claude-v2"),
            ModelFamily::AwsClaude
        );
    }

    #[test]
    fn test_partition_claude_and_bison() {
        assert_eq!(
            ModelFamily::partition(ProviderKind::Anthropic, "claude-instant-v1"),
            ModelFamily::Claude
        );
        assert_eq!(
            ModelFamily::partition(ProviderKind::GooglePalm, "text-bison-001"),
            ModelFamily::Bison
        );
    }

    #[test]
    fn test_family_provider_mapping() {
        for family in ALL_FAMILIES {
            // The representative model maps back to the same family.
            let provider = family.provider();
            assert_eq!(
                ModelFamily::partition(provider, family.representative_model()),
                family
            );
        }
    }

    #[test]
    fn test_from_str_round_trip() {
        for family in ALL_FAMILIES {
            assert_eq!(family.as_str().parse::<ModelFamily>().unwrap(), family);
        }
        assert!("gpt5".parse::<ModelFamily>().is_err());
    }
}
