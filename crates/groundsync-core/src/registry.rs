//! # Model Registry
//!
//! Explicit catalogue of every synced model in a process. Models are
//! registered by setup code; nothing is discovered implicitly.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  register(model)      → duplicate name / table rejected immediately     │
//! │  check_references()   → every Reference / ManyToMany target registered  │
//! │  model(name)          → Arc<SyncedModel> or UnknownModel                │
//! │  scheduled()          → models with a sync_interval                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Models may reference models registered later (or themselves), which is
//! why target checks run as a separate step once registration is complete.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::model::SyncedModel;

/// Catalogue of registered models, in registration order.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<Arc<SyncedModel>>,
    by_name: HashMap<String, usize>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every model and checks cross-model references.
    pub fn from_models(models: impl IntoIterator<Item = SyncedModel>) -> CoreResult<Self> {
        let mut registry = Self::new();
        for model in models {
            registry.register(model)?;
        }
        registry.check_references()?;
        Ok(registry)
    }

    /// Adds a model.
    ///
    /// ## Errors
    /// `CoreError::DuplicateModel` if the name, or the table, is already taken.
    pub fn register(&mut self, model: SyncedModel) -> CoreResult<Arc<SyncedModel>> {
        if self.by_name.contains_key(model.name()) {
            return Err(CoreError::DuplicateModel(model.name().to_string()));
        }
        if self.models.iter().any(|m| m.table() == model.table()) {
            return Err(CoreError::DuplicateModel(format!(
                "{} (table {})",
                model.name(),
                model.table()
            )));
        }

        let model = Arc::new(model);
        self.by_name
            .insert(model.name().to_string(), self.models.len());
        self.models.push(model.clone());
        Ok(model)
    }

    /// Verifies that every relation field targets a registered model.
    pub fn check_references(&self) -> CoreResult<()> {
        for model in &self.models {
            for (field, target) in model.related_models() {
                if !self.by_name.contains_key(target) {
                    return Err(CoreError::UnknownReferenceTarget {
                        model: model.name().to_string(),
                        field: field.name.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<SyncedModel>> {
        self.by_name.get(name).map(|&i| &self.models[i])
    }

    /// Looks up a model by name.
    pub fn model(&self, name: &str) -> CoreResult<&Arc<SyncedModel>> {
        self.get(name)
            .ok_or_else(|| CoreError::UnknownModel(name.to_string()))
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<SyncedModel>> {
        self.models.iter()
    }

    /// Models that declare an auto-sync interval.
    pub fn scheduled(&self) -> impl Iterator<Item = &Arc<SyncedModel>> {
        self.models
            .iter()
            .filter(|m| m.sync_config().sync_interval().is_some())
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDef;
    use crate::model::SyncConfig;
    use crate::test_support::StaticDatasource;

    fn model(name: &str, table: &str, fields: Vec<FieldDef>, auto: bool) -> SyncedModel {
        let mut config =
            SyncConfig::builder().datasource(Arc::new(StaticDatasource::default()));
        if !auto {
            config = config.no_auto_sync();
        }
        SyncedModel::builder(name)
            .table(table)
            .fields(fields)
            .sync_config(config.build().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ModelRegistry::from_models([
            model("constituency", "constituencies", vec![FieldDef::text("name")], true),
            model(
                "member",
                "members",
                vec![FieldDef::reference("constituency", "constituency")],
                false,
            ),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.model("member").unwrap().table(), "members");
        assert!(matches!(
            registry.model("ward"),
            Err(CoreError::UnknownModel(ref name)) if name == "ward"
        ));

        let scheduled: Vec<_> = registry.scheduled().map(|m| m.name().to_string()).collect();
        assert_eq!(scheduled, vec!["constituency".to_string()]);
    }

    #[test]
    fn test_duplicate_name_or_table_rejected() {
        let mut registry = ModelRegistry::new();
        registry
            .register(model("person", "people", vec![], true))
            .unwrap();

        assert!(matches!(
            registry.register(model("person", "persons", vec![], true)),
            Err(CoreError::DuplicateModel(_))
        ));
        assert!(matches!(
            registry.register(model("member", "people", vec![], true)),
            Err(CoreError::DuplicateModel(_))
        ));
    }

    #[test]
    fn test_forward_and_self_references() {
        let result = ModelRegistry::from_models([
            model(
                "person",
                "person",
                vec![
                    FieldDef::reference("mentor", "person"),
                    FieldDef::many_to_many("offices", "office"),
                ],
                true,
            ),
            model("office", "office", vec![], true),
        ]);
        assert!(result.is_ok());
    }

    #[test]
    fn test_unknown_reference_target() {
        let result = ModelRegistry::from_models([model(
            "person",
            "person",
            vec![FieldDef::reference("mentor", "teacher")],
            true,
        )]);

        assert!(matches!(
            result,
            Err(CoreError::UnknownReferenceTarget { ref target, .. }) if target == "teacher"
        ));
    }
}
