//! Business logic services

pub mod catalog;
pub mod clock;
pub mod lending;
pub mod privilege;
pub mod sweep;
pub mod users;

use std::sync::Arc;

use crate::repository::Repository;

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub catalog: catalog::CatalogService,
    pub lending: lending::LendingService,
    pub users: users::UsersService,
    pub sweep: Arc<sweep::OverdueSweep>,
}

impl Services {
    /// Create all services over one repository and one source of "today"
    pub fn new(repository: Repository, clock: Arc<dyn clock::Clock>) -> Self {
        Self {
            catalog: catalog::CatalogService::new(repository.clone()),
            lending: lending::LendingService::new(repository.clone(), clock.clone()),
            users: users::UsersService::new(repository.clone()),
            sweep: Arc::new(sweep::OverdueSweep::new(repository, clock)),
        }
    }
}
