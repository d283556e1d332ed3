//! Context passed to every service operation: pool, resolved model, service registry, settings.

use crate::config::{ResolvedModel, Settings};
use crate::error::AppError;
use crate::permission::Evaluator;
use crate::service::{CompositeEntityService, DatabaseService, UnaryEntityService};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

/// Entity name -> service, built once at startup.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn DatabaseService>>,
}

impl ServiceRegistry {
    /// Entities declaring relationships get the composite service, the rest the unary one.
    pub fn build(model: &ResolvedModel) -> Self {
        let services = model
            .entities
            .iter()
            .map(|(name, entity)| {
                let svc: Arc<dyn DatabaseService> = if entity.is_composite() {
                    Arc::new(CompositeEntityService::new(entity.clone()))
                } else {
                    Arc::new(UnaryEntityService::new(entity.clone()))
                };
                (name.clone(), svc)
            })
            .collect();
        Self { services }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn DatabaseService>> {
        self.services.get(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub model: Arc<ResolvedModel>,
    pub services: Arc<ServiceRegistry>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(pool: PgPool, model: ResolvedModel, settings: Settings) -> Self {
        let services = ServiceRegistry::build(&model);
        tracing::info!(entities = services.len(), "service registry built");
        Self {
            pool,
            model: Arc::new(model),
            services: Arc::new(services),
            settings: Arc::new(settings),
        }
    }

    pub fn service(&self, entity: &str) -> Result<Arc<dyn DatabaseService>, AppError> {
        self.services
            .get(entity)
            .cloned()
            .ok_or_else(|| AppError::BadRequest(format!("unknown entity '{}'", entity)))
    }

    pub fn evaluator(&self) -> Evaluator<'_> {
        Evaluator::new(&self.model, &self.settings.sys_schema)
    }
}
