//! In-memory cloud provider.
//!
//! Backs `driver = "mock"` for local development and every test that needs a
//! provider. Faults are scripted per call so tests can reproduce transient
//! outages, lost acknowledgements and eventual consistency deterministically.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CloudDriver, CloudError, CloudInstance, InstanceId, InstanceState, TAG_NODE_ID};
use crate::size::NodeSize;

/// Scripted outcome for the next create call.
#[derive(Debug, Clone)]
pub enum CreateFault {
    /// Fail without creating anything.
    Error(CloudError),
    /// Create the instance but report a transient failure, as if the response
    /// was lost on the way back.
    LoseAck,
}

#[derive(Debug, Default)]
struct MockState {
    instances: BTreeMap<InstanceId, MockInstance>,
    create_faults: VecDeque<CreateFault>,
    destroy_faults: VecDeque<CloudError>,
    failing_lists: u32,
    /// Lists an instance stays invisible for after creation.
    visibility_delay: u32,
    next_id: u64,
}

#[derive(Debug, Clone)]
struct MockInstance {
    instance: CloudInstance,
    hidden_for: u32,
}

/// In-memory provider with fault injection.
#[derive(Debug, Default)]
pub struct MockCloud {
    state: Mutex<MockState>,
    creates: AtomicU32,
    destroys: AtomicU32,
    lists: AtomicU32,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next create call.
    pub async fn script_create(&self, fault: CreateFault) {
        self.state.lock().await.create_faults.push_back(fault);
    }

    /// Queue an error for the next destroy call.
    pub async fn script_destroy(&self, error: CloudError) {
        self.state.lock().await.destroy_faults.push_back(error);
    }

    /// Fail the next `n` list calls with a transient error.
    pub async fn fail_lists(&self, n: u32) {
        self.state.lock().await.failing_lists = n;
    }

    /// Hide new instances from the next `lists` list calls after creation.
    pub async fn set_visibility_delay(&self, lists: u32) {
        self.state.lock().await.visibility_delay = lists;
    }

    /// Add an instance this process did not create.
    pub async fn insert_instance(&self, instance: CloudInstance) {
        self.state.lock().await.instances.insert(
            instance.id.clone(),
            MockInstance {
                instance,
                hidden_for: 0,
            },
        );
    }

    /// Make an instance vanish without a destroy call.
    pub async fn remove_instance(&self, id: &InstanceId) -> Option<CloudInstance> {
        self.state
            .lock()
            .await
            .instances
            .remove(id)
            .map(|m| m.instance)
    }

    pub async fn instance(&self, id: &InstanceId) -> Option<CloudInstance> {
        self.state
            .lock()
            .await
            .instances
            .get(id)
            .map(|m| m.instance.clone())
    }

    /// Every instance, visible or not.
    pub async fn instances(&self) -> Vec<CloudInstance> {
        self.state
            .lock()
            .await
            .instances
            .values()
            .map(|m| m.instance.clone())
            .collect()
    }

    pub fn create_calls(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> u32 {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> u32 {
        self.lists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudDriver for MockCloud {
    fn name(&self) -> &str {
        "mock"
    }

    async fn list(&self) -> Result<Vec<CloudInstance>, CloudError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;

        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(CloudError::Transient("mock list outage".into()));
        }

        let mut visible = Vec::new();
        for entry in state.instances.values_mut() {
            if entry.hidden_for > 0 {
                entry.hidden_for -= 1;
                continue;
            }
            if entry.instance.state == InstanceState::Pending {
                entry.instance.state = InstanceState::Running;
            }
            visible.push(entry.instance.clone());
        }
        Ok(visible)
    }

    async fn create(
        &self,
        _size: &NodeSize,
        tags: &BTreeMap<String, String>,
    ) -> Result<InstanceId, CloudError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;

        let fault = state.create_faults.pop_front();
        if let Some(CreateFault::Error(e)) = &fault {
            return Err(e.clone());
        }

        // The node id tag doubles as an idempotency token.
        let existing = tags.get(TAG_NODE_ID).and_then(|token| {
            state
                .instances
                .values()
                .find(|m| m.instance.tags.get(TAG_NODE_ID) == Some(token))
                .map(|m| m.instance.id.clone())
        });

        let id = match existing {
            Some(id) => id,
            None => {
                state.next_id += 1;
                let id = InstanceId::new(format!("mock-{:06}", state.next_id));
                let hidden_for = state.visibility_delay;
                state.instances.insert(
                    id.clone(),
                    MockInstance {
                        instance: CloudInstance {
                            id: id.clone(),
                            state: InstanceState::Pending,
                            tags: tags.clone(),
                        },
                        hidden_for,
                    },
                );
                id
            }
        };

        match fault {
            Some(CreateFault::LoseAck) => Err(CloudError::Transient("mock lost ack".into())),
            _ => Ok(id),
        }
    }

    async fn destroy(&self, id: &InstanceId) -> Result<(), CloudError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;

        if let Some(e) = state.destroy_faults.pop_front() {
            return Err(e);
        }

        match state.instances.remove(id) {
            Some(_) => Ok(()),
            None => Err(CloudError::NotFound(id.clone())),
        }
    }
}
