//! Static-priority provider selector.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::Notification;
use crate::error::Result;

use super::{exhausted_error, Provider, Selector, SelectorBuilder};

/// Walks the provider list in configured priority order, once.
struct SequentialSelector {
    idx: usize,
    providers: Arc<[Arc<dyn Provider>]>,
}

#[async_trait]
impl Selector for SequentialSelector {
    async fn next(&mut self, _notification: &Notification) -> Result<Arc<dyn Provider>> {
        if self.idx == self.providers.len() {
            return Err(exhausted_error());
        }
        let provider = self.providers[self.idx].clone();
        self.idx += 1;
        Ok(provider)
    }
}

pub struct SequentialSelectorBuilder {
    providers: Arc<[Arc<dyn Provider>]>,
}

impl SequentialSelectorBuilder {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            providers: providers.into(),
        }
    }
}

impl SelectorBuilder for SequentialSelectorBuilder {
    fn build(&self) -> Box<dyn Selector> {
        Box::new(SequentialSelector {
            idx: 0,
            providers: self.providers.clone(),
        })
    }
}
