use std::sync::Arc;

use crate::{config::Config, dispatcher::Dispatcher};

#[derive(Clone)]
pub struct HttpState {
    pub config: Config,
    pub dispatcher: Arc<Dispatcher>,
}

impl HttpState {
    pub fn new(config: Config, dispatcher: Arc<Dispatcher>) -> Self {
        Self { config, dispatcher }
    }
}
