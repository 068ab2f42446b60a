//! Tariff catalog
//!
//! Tariffs are configured operationally and never persisted. Each one carries
//! the base price owed to the owner per standard period and an opaque bag of
//! provisioning parameters forwarded to the gateway.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Number of configurable tariff slots.
pub const MAX_TARIFFS: u32 = 4;

/// Provisioning parameters. `None` means "inherit the global default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningParams {
    pub traffic_limit_gb: Option<i64>,
    pub traffic_reset_strategy: Option<String>,
    pub hwid_device_limit: Option<i64>,
    pub tag: Option<String>,
    pub internal_squads: Option<Vec<String>>,
    pub external_squad: Option<String>,
}

impl ProvisioningParams {
    /// Fill every unset field from `defaults`.
    pub fn or(&self, defaults: &ProvisioningParams) -> ProvisioningParams {
        ProvisioningParams {
            traffic_limit_gb: self.traffic_limit_gb.or(defaults.traffic_limit_gb),
            traffic_reset_strategy: self
                .traffic_reset_strategy
                .clone()
                .or_else(|| defaults.traffic_reset_strategy.clone()),
            hwid_device_limit: self.hwid_device_limit.or(defaults.hwid_device_limit),
            tag: self.tag.clone().or_else(|| defaults.tag.clone()),
            internal_squads: self
                .internal_squads
                .clone()
                .or_else(|| defaults.internal_squads.clone()),
            external_squad: self
                .external_squad
                .clone()
                .or_else(|| defaults.external_squad.clone()),
        }
    }
}

/// A named pricing and provisioning profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tariff {
    /// Slot number, 1-based
    pub id: u32,
    pub name: String,
    pub base_price: i64,
    pub description: Option<String>,
    /// Telegram ids allowed to use this tariff; empty means everyone
    pub agent_ids: BTreeSet<i64>,
    pub provisioning: ProvisioningParams,
}

impl Tariff {
    pub fn is_visible_to(&self, telegram_id: i64) -> bool {
        self.agent_ids.is_empty() || self.agent_ids.contains(&telegram_id)
    }
}

/// The immutable set of tariffs loaded at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TariffCatalog {
    tariffs: Vec<Tariff>,
}

impl TariffCatalog {
    pub fn new(tariffs: Vec<Tariff>) -> Self {
        Self { tariffs }
    }

    pub fn all(&self) -> &[Tariff] {
        &self.tariffs
    }

    pub fn is_empty(&self) -> bool {
        self.tariffs.is_empty()
    }

    /// Tariffs offered to `telegram_id`. Privileged callers see all of them.
    pub fn visible_to(&self, telegram_id: i64, show_all: bool) -> Vec<Tariff> {
        self.tariffs
            .iter()
            .filter(|t| show_all || t.is_visible_to(telegram_id))
            .cloned()
            .collect()
    }

    pub fn find(&self, id: u32) -> Option<&Tariff> {
        self.tariffs.iter().find(|t| t.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tariff(id: u32, agent_ids: &[i64]) -> Tariff {
        Tariff {
            id,
            name: format!("Tariff {}", id),
            base_price: 100 * id as i64,
            description: None,
            agent_ids: agent_ids.iter().copied().collect(),
            provisioning: ProvisioningParams::default(),
        }
    }

    #[test]
    fn test_visibility_respects_agent_sets() {
        let catalog = TariffCatalog::new(vec![tariff(1, &[]), tariff(2, &[42]), tariff(3, &[7])]);

        let ids: Vec<u32> = catalog.visible_to(42, false).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2]);

        let ids: Vec<u32> = catalog.visible_to(99, false).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1]);

        assert_eq!(catalog.visible_to(99, true).len(), 3);
    }

    #[test]
    fn test_params_inherit_unset_fields() {
        let defaults = ProvisioningParams {
            traffic_limit_gb: Some(50),
            traffic_reset_strategy: Some("MONTH".to_string()),
            hwid_device_limit: Some(3),
            tag: Some("RESELL".to_string()),
            internal_squads: Some(vec!["a".to_string()]),
            external_squad: None,
        };
        let own = ProvisioningParams {
            traffic_limit_gb: Some(0),
            tag: Some("VIP".to_string()),
            ..Default::default()
        };

        let merged = own.or(&defaults);
        assert_eq!(merged.traffic_limit_gb, Some(0));
        assert_eq!(merged.tag.as_deref(), Some("VIP"));
        assert_eq!(merged.traffic_reset_strategy.as_deref(), Some("MONTH"));
        assert_eq!(merged.hwid_device_limit, Some(3));
        assert_eq!(merged.internal_squads, Some(vec!["a".to_string()]));
        assert_eq!(merged.external_squad, None);
    }

    #[test]
    fn test_find_by_slot() {
        let catalog = TariffCatalog::new(vec![tariff(2, &[])]);
        assert!(catalog.find(2).is_some());
        assert!(catalog.find(1).is_none());
        assert!(!catalog.is_empty());
        assert!(TariffCatalog::default().is_empty());
    }
}
