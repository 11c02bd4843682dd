use std::sync::Arc;

use crate::core::{config::Settings, redis::RedisHandle};
use crate::repositories::store::PrintStore;
use crate::services::dispatch::Dispatcher;
use crate::services::storage::PageStore;
use crate::services::vision::VisionAdapter;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    redis: RedisHandle,
    store: Arc<dyn PrintStore>,
    pages: Option<Arc<dyn PageStore>>,
    vision: Arc<dyn VisionAdapter>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        redis: RedisHandle,
        store: Arc<dyn PrintStore>,
        pages: Option<Arc<dyn PageStore>>,
        vision: Arc<dyn VisionAdapter>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(InnerState { settings, redis, store, pages, vision, dispatcher }),
        }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub(crate) fn store(&self) -> &dyn PrintStore {
        self.inner.store.as_ref()
    }

    pub(crate) fn pages(&self) -> Option<&dyn PageStore> {
        self.inner.pages.as_deref()
    }

    pub(crate) fn vision(&self) -> &dyn VisionAdapter {
        self.inner.vision.as_ref()
    }

    pub(crate) fn dispatcher(&self) -> &dyn Dispatcher {
        self.inner.dispatcher.as_ref()
    }
}
