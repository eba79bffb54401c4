//! Install configuration.
//!
//! [`Config`] holds the operator's persistent settings. A caller can
//! override a subset per job with [`ConfigOverride`]; the two are
//! resolved once, at job start, into an immutable [`Policy`] that the
//! planner and executor consult. Nothing re-reads configuration after
//! that point, so a job sees one coherent set of switches.

use tracing::debug;

/// Persistent install settings.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Write content to the removable storage root instead of the
    /// internal one.
    pub sd_card_install: bool,
    /// Allow replacing an installed title with an older version.
    pub allow_downgrade: bool,
    /// Skip titles whose full content set is already installed.
    pub skip_if_already_installed: bool,
    /// Install tickets only, no content.
    pub ticket_only: bool,
    pub skip_base: bool,
    pub skip_patch: bool,
    pub skip_addon: bool,
    pub skip_data_patch: bool,
    /// Do not install tickets even when content needs one at runtime.
    pub skip_ticket: bool,
    pub skip_nca_hash_verify: bool,
    pub skip_rsa_header_fixed_key_verify: bool,
    pub skip_rsa_npdm_fixed_key_verify: bool,
    /// Accept archives with the game-card distribution bit set.
    pub ignore_distribution_bit: bool,
    /// Rewrite title-key archives to standard crypto so the installed
    /// copy needs no ticket. Never applied to add-on content.
    pub convert_to_standard_crypto: bool,
    /// Re-wrap key areas under master key generation 0. Implies
    /// standard-crypto conversion.
    pub lower_master_key: bool,
    /// Zero the required-system-version field in installed manifests.
    pub lower_system_version: bool,
}

/// Per-job overrides; `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverride {
    pub sd_card_install: Option<bool>,
    pub allow_downgrade: Option<bool>,
    pub skip_if_already_installed: Option<bool>,
    pub ticket_only: Option<bool>,
    pub skip_ticket: Option<bool>,
    pub convert_to_standard_crypto: Option<bool>,
    pub lower_master_key: Option<bool>,
    pub lower_system_version: Option<bool>,
}

/// Effective switches for one install job.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub sd_card_install: bool,
    pub allow_downgrade: bool,
    pub skip_if_already_installed: bool,
    pub ticket_only: bool,
    pub skip_base: bool,
    pub skip_patch: bool,
    pub skip_addon: bool,
    pub skip_data_patch: bool,
    pub skip_ticket: bool,
    pub skip_nca_hash_verify: bool,
    pub skip_rsa_header_fixed_key_verify: bool,
    pub skip_rsa_npdm_fixed_key_verify: bool,
    pub ignore_distribution_bit: bool,
    pub convert_to_standard_crypto: bool,
    pub lower_master_key: bool,
    pub lower_system_version: bool,
}

impl Policy {
    /// Resolve the configured values against a job's overrides.
    pub fn resolve(config: &Config, overrides: &ConfigOverride) -> Self {
        let lower_master_key = overrides.lower_master_key.unwrap_or(config.lower_master_key);
        let convert_to_standard_crypto = lower_master_key
            || overrides
                .convert_to_standard_crypto
                .unwrap_or(config.convert_to_standard_crypto);

        let policy = Self {
            sd_card_install: overrides.sd_card_install.unwrap_or(config.sd_card_install),
            allow_downgrade: overrides.allow_downgrade.unwrap_or(config.allow_downgrade),
            skip_if_already_installed: overrides
                .skip_if_already_installed
                .unwrap_or(config.skip_if_already_installed),
            ticket_only: overrides.ticket_only.unwrap_or(config.ticket_only),
            skip_base: config.skip_base,
            skip_patch: config.skip_patch,
            skip_addon: config.skip_addon,
            skip_data_patch: config.skip_data_patch,
            skip_ticket: overrides.skip_ticket.unwrap_or(config.skip_ticket),
            skip_nca_hash_verify: config.skip_nca_hash_verify,
            skip_rsa_header_fixed_key_verify: config.skip_rsa_header_fixed_key_verify,
            skip_rsa_npdm_fixed_key_verify: config.skip_rsa_npdm_fixed_key_verify,
            ignore_distribution_bit: config.ignore_distribution_bit,
            convert_to_standard_crypto,
            lower_master_key,
            lower_system_version: overrides
                .lower_system_version
                .unwrap_or(config.lower_system_version),
        };
        debug!(?policy, "resolved install policy");
        policy
    }

    /// Whether any verification step is disabled, which marks written
    /// archives as unverified.
    pub fn skips_any_verification(&self) -> bool {
        self.skip_nca_hash_verify
            || self.skip_rsa_header_fixed_key_verify
            || self.skip_rsa_npdm_fixed_key_verify
            || self.ignore_distribution_bit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_and_absent_overrides_keep_config() {
        let config = Config {
            sd_card_install: true,
            ticket_only: false,
            ..Config::default()
        };
        let overrides = ConfigOverride {
            ticket_only: Some(true),
            ..ConfigOverride::default()
        };

        let policy = Policy::resolve(&config, &overrides);
        assert!(policy.sd_card_install);
        assert!(policy.ticket_only);
    }

    #[test]
    fn lower_master_key_implies_conversion() {
        let config = Config {
            lower_master_key: true,
            ..Config::default()
        };
        let policy = Policy::resolve(&config, &ConfigOverride::default());
        assert!(policy.convert_to_standard_crypto);

        // Also when the flag arrives through an override.
        let policy = Policy::resolve(
            &Config::default(),
            &ConfigOverride {
                lower_master_key: Some(true),
                ..ConfigOverride::default()
            },
        );
        assert!(policy.convert_to_standard_crypto);
        assert!(policy.lower_master_key);
    }

    #[test]
    fn verification_skips_are_reported() {
        let policy = Policy::resolve(&Config::default(), &ConfigOverride::default());
        assert!(!policy.skips_any_verification());

        let policy = Policy::resolve(
            &Config {
                skip_nca_hash_verify: true,
                ..Config::default()
            },
            &ConfigOverride::default(),
        );
        assert!(policy.skips_any_verification());
    }

    #[test]
    fn default_config_is_strict() {
        let config = Config::default();
        assert!(!config.skip_nca_hash_verify);
        assert!(!config.allow_downgrade);
        assert!(!config.convert_to_standard_crypto);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn resolution_invariants_hold_for_any_combination(
            cfg_lower in any::<bool>(),
            cfg_convert in any::<bool>(),
            cfg_ticket_only in any::<bool>(),
            ovr_lower in proptest::option::of(any::<bool>()),
            ovr_convert in proptest::option::of(any::<bool>()),
            ovr_ticket_only in proptest::option::of(any::<bool>()),
        ) {
            let config = Config {
                lower_master_key: cfg_lower,
                convert_to_standard_crypto: cfg_convert,
                ticket_only: cfg_ticket_only,
                ..Config::default()
            };
            let overrides = ConfigOverride {
                lower_master_key: ovr_lower,
                convert_to_standard_crypto: ovr_convert,
                ticket_only: ovr_ticket_only,
                ..ConfigOverride::default()
            };
            let policy = Policy::resolve(&config, &overrides);

            // An override always wins over the configured value.
            prop_assert_eq!(
                policy.ticket_only,
                ovr_ticket_only.unwrap_or(cfg_ticket_only)
            );
            prop_assert_eq!(policy.lower_master_key, ovr_lower.unwrap_or(cfg_lower));
            // Lowering the master key always forces conversion.
            if policy.lower_master_key {
                prop_assert!(policy.convert_to_standard_crypto);
            } else {
                prop_assert_eq!(
                    policy.convert_to_standard_crypto,
                    ovr_convert.unwrap_or(cfg_convert)
                );
            }
        }
    }
}
