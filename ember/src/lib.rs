pub mod configuration;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod lifecycle;
pub mod model;
pub mod reconcile;
pub mod startup;
pub mod token_broker;
pub mod vm_client;

use sqlx::PgPool;
use std::sync::Arc;

use crate::reconcile::WorkQueue;

#[derive(Clone)]
pub struct App {
    pool: Arc<PgPool>,
    queue: WorkQueue,
}

impl App {
    pub fn new(pool: PgPool, queue: WorkQueue) -> Self {
        Self {
            pool: Arc::new(pool),
            queue,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_arc(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }
}
