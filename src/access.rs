//! Role assignment, the private-mode gate and the role→model table.

use crate::config::{Config, TelegramConfig};
use crate::{TelegramId, User, UserRole};

use std::collections::{BTreeSet, HashMap};

/// Who may use the bot and which models each role unlocks.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    is_public: bool,
    admin_ids: Vec<TelegramId>,
    premium_ids: Vec<TelegramId>,
    available_for_roles: Vec<UserRole>,
    models_by_role: HashMap<UserRole, Vec<String>>,
}

impl AccessPolicy {
    pub fn new(telegram: &TelegramConfig, models_by_role: HashMap<UserRole, Vec<String>>) -> Self {
        Self {
            is_public: telegram.is_public,
            admin_ids: telegram.admin_ids.clone(),
            premium_ids: telegram.premium_ids.clone(),
            available_for_roles: telegram.available_for_roles.clone(),
            models_by_role,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.telegram, config.access.clone())
    }

    /// Public policy where every role maps to the same models. Handy for tests
    /// and single-model deployments.
    pub fn public_with_models<I, S>(roles: &[UserRole], models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let models: Vec<String> = models.into_iter().map(Into::into).collect();
        Self {
            is_public: true,
            models_by_role: roles.iter().map(|role| (*role, models.clone())).collect(),
            ..Self::default()
        }
    }

    /// Roles a telegram user receives on first contact.
    pub fn roles_for(&self, telegram_id: TelegramId) -> Vec<UserRole> {
        let mut roles = vec![UserRole::Default];
        if self.admin_ids.contains(&telegram_id) {
            roles.push(UserRole::Admin);
        }
        if self.premium_ids.contains(&telegram_id) {
            roles.push(UserRole::Premium);
        }
        roles
    }

    /// Whether the telegram user may talk to the bot at all.
    pub fn is_allowed(&self, telegram_id: TelegramId) -> bool {
        if self.is_public {
            return true;
        }

        self.roles_for(telegram_id)
            .iter()
            .any(|role| self.available_for_roles.contains(role))
    }

    /// Union of the models granted by the user's roles, sorted.
    pub fn available_models(&self, user: &User) -> BTreeSet<String> {
        user.roles
            .iter()
            .filter_map(|role| self.models_by_role.get(role))
            .flatten()
            .cloned()
            .collect()
    }

    /// Every model any role grants.
    pub fn configured_models(&self) -> BTreeSet<String> {
        self.models_by_role.values().flatten().cloned().collect()
    }

    pub fn can_use_model(&self, user: &User, model: &str) -> bool {
        user.roles.iter().any(|role| {
            self.models_by_role
                .get(role)
                .is_some_and(|models| models.iter().any(|m| m == model))
        })
    }
}
