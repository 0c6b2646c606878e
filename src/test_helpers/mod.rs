//! Test Helpers
//!
//! An in-process fake platform with a driver, a client and a fully capable resource
//! plugin, plus [`TestHarness`] which wires them into a [`ControlPlane`] backed by the
//! in-memory gateway with one active container.
//!
//! The fake keeps a remote inventory keyed by `ext_id`. Tests mutate it directly
//! (`add_remote`, `rename_remote`, `remove_remote`) to simulate drift for reconciliation,
//! and inject failures into individual plugin hooks with [`FakePlatform::fail_on`].

use crate::auth::{AllowAllAuthorizer, Authorizer};
use crate::config::{ConfigManager, CoreConfig};
use crate::error::{CoreError, CoreResult};
use crate::models::{merge_attribute, objid, Container, EntityKey, NewResource, Resource};
use crate::orchestration::{
    ContainerRequest, ContainerSession, ControlPlane, CoreServices, CreateRequest,
    OperationContext,
};
use crate::plugin::{
    Actionable, ContainerDriver, Creatable, Deletable, DiscoveredEntity, Discoverable,
    Importable, PlatformClient, RemoteEntity, ResourcePlugin, SyncedResource, Updatable,
};
use crate::state_machine::ResourceState;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Entity held by the fake remote platform
#[derive(Debug, Clone, PartialEq)]
pub struct FakeEntity {
    pub resource_type: String,
    pub ext_id: String,
    pub name: String,
    pub parent_ext_id: Option<String>,
    pub level: u32,
    pub attributes: Value,
}

struct InjectedFailure {
    error: CoreError,
    /// `None` fails forever
    remaining: Option<u32>,
}

/// Shared state of the fake remote platform
pub struct FakePlatform {
    reachable: AtomicBool,
    connects: AtomicUsize,
    next_id: AtomicU64,
    delay_ms: AtomicU64,
    inventory: Mutex<BTreeMap<String, FakeEntity>>,
    failures: Mutex<HashMap<String, InjectedFailure>>,
    calls: Mutex<Vec<String>>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            delay_ms: AtomicU64::new(0),
            inventory: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Slow down every business hook
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Make `hook` (e.g. `do_create`) fail with `error` until cleared
    pub fn fail_on(&self, hook: &str, error: CoreError) {
        self.failures.lock().insert(
            hook.to_string(),
            InjectedFailure {
                error,
                remaining: None,
            },
        );
    }

    /// Make `hook` fail with `error` for the next `times` calls
    pub fn fail_times(&self, hook: &str, error: CoreError, times: u32) {
        self.failures.lock().insert(
            hook.to_string(),
            InjectedFailure {
                error,
                remaining: Some(times),
            },
        );
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Hooks invoked so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, hook: &str) -> usize {
        self.calls.lock().iter().filter(|call| *call == hook).count()
    }

    /// Add an entity behind the control plane's back; returns its `ext_id`
    pub fn add_remote(
        &self,
        resource_type: &str,
        name: &str,
        parent_ext_id: Option<&str>,
    ) -> String {
        let ext_id = format!("ext-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut inventory = self.inventory.lock();
        let level = parent_ext_id
            .and_then(|parent| inventory.get(parent))
            .map_or(0, |parent| parent.level + 1);
        inventory.insert(
            ext_id.clone(),
            FakeEntity {
                resource_type: resource_type.to_string(),
                ext_id: ext_id.clone(),
                name: name.to_string(),
                parent_ext_id: parent_ext_id.map(str::to_string),
                level,
                attributes: json!({}),
            },
        );
        ext_id
    }

    pub fn rename_remote(&self, ext_id: &str, name: &str) -> bool {
        match self.inventory.lock().get_mut(ext_id) {
            Some(entity) => {
                entity.name = name.to_string();
                true
            }
            None => false,
        }
    }

    pub fn set_remote_attributes(&self, ext_id: &str, attributes: Value) -> bool {
        match self.inventory.lock().get_mut(ext_id) {
            Some(entity) => {
                entity.attributes = attributes;
                true
            }
            None => false,
        }
    }

    pub fn remove_remote(&self, ext_id: &str) -> Option<FakeEntity> {
        self.inventory.lock().remove(ext_id)
    }

    pub fn remote(&self, ext_id: &str) -> Option<FakeEntity> {
        self.inventory.lock().get(ext_id).cloned()
    }

    pub fn remote_count(&self) -> usize {
        self.inventory.lock().len()
    }

    fn remote_of_type(&self, resource_type: &str) -> Vec<FakeEntity> {
        self.inventory
            .lock()
            .values()
            .filter(|entity| entity.resource_type == resource_type)
            .cloned()
            .collect()
    }

    /// Record the call, then apply the configured delay and any injected failure
    async fn enter(&self, hook: &str) -> CoreResult<()> {
        self.calls.lock().push(hook.to_string());
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut failures = self.failures.lock();
        let Some(failure) = failures.get_mut(hook) else {
            return Ok(());
        };
        let error = failure.error.clone();
        let exhausted = match failure.remaining.as_mut() {
            None => false,
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
        };
        if exhausted {
            failures.remove(hook);
        }
        Err(error)
    }
}

/// Platform client handed out by [`FakeDriver`]
pub struct FakeClient {
    platform: Arc<FakePlatform>,
}

impl FakeClient {
    pub fn platform(&self) -> &Arc<FakePlatform> {
        &self.platform
    }
}

#[async_trait]
impl PlatformClient for FakeClient {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn ping(&self) -> bool {
        self.platform.is_reachable()
    }
}

pub struct FakeDriver {
    platform: Arc<FakePlatform>,
}

impl FakeDriver {
    pub const CONTAINER_TYPE: &'static str = "Fake";
    pub const IMPLEMENTATION_CLASS: &'static str = "cloudmgr.fake.FakeContainer";

    pub fn new(platform: Arc<FakePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    fn container_type(&self) -> &str {
        Self::CONTAINER_TYPE
    }

    fn implementation_class(&self) -> &str {
        Self::IMPLEMENTATION_CLASS
    }

    async fn validate_connection(&self, connection: &Value) -> CoreResult<()> {
        if connection.is_null() || connection.is_object() {
            Ok(())
        } else {
            Err(CoreError::Validation(
                "fake connection must be a JSON object".to_string(),
            ))
        }
    }

    async fn connect(&self, container: &Container) -> anyhow::Result<Arc<dyn PlatformClient>> {
        if !self.platform.is_reachable() {
            anyhow::bail!("container {} is unreachable", container.name);
        }
        self.platform.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeClient {
            platform: self.platform.clone(),
        }))
    }
}

/// Resource plugin implementing every capability against [`FakePlatform`]
pub struct FakeResourcePlugin {
    resource_type: String,
    implementation_class: String,
    platform: Arc<FakePlatform>,
    runs_remote: bool,
}

impl FakeResourcePlugin {
    pub fn new(resource_type: &str, platform: Arc<FakePlatform>) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            implementation_class: format!("cloudmgr.fake.{resource_type}"),
            platform,
            runs_remote: true,
        }
    }

    /// Plugin whose operations run inline by default
    pub fn local(mut self) -> Self {
        self.runs_remote = false;
        self
    }

    fn client<'a>(&self, session: &'a ContainerSession) -> CoreResult<&'a FakeClient> {
        session.client_as::<FakeClient>().ok_or_else(|| {
            CoreError::Internal(format!(
                "container {} is not a fake platform",
                session.container().id
            ))
        })
    }
}

impl ResourcePlugin for FakeResourcePlugin {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn implementation_class(&self) -> &str {
        &self.implementation_class
    }

    fn container_type(&self) -> &str {
        FakeDriver::CONTAINER_TYPE
    }

    fn runs_remote(&self) -> bool {
        self.runs_remote
    }

    fn creatable(&self) -> Option<&dyn Creatable> {
        Some(self)
    }

    fn importable(&self) -> Option<&dyn Importable> {
        Some(self)
    }

    fn updatable(&self) -> Option<&dyn Updatable> {
        Some(self)
    }

    fn deletable(&self) -> Option<&dyn Deletable> {
        Some(self)
    }

    fn actionable(&self) -> Option<&dyn Actionable> {
        Some(self)
    }

    fn discoverable(&self) -> Option<&dyn Discoverable> {
        Some(self)
    }
}

#[async_trait]
impl Creatable for FakeResourcePlugin {
    async fn pre_create(
        &self,
        _container: &Container,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        if ctx.param_bool("invalid", false) {
            return Err(CoreError::Validation("rejected by pre_create".to_string()));
        }
        Ok(ctx)
    }

    async fn do_create(
        &self,
        session: &ContainerSession,
        mut ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        let platform = self.client(session)?.platform();
        platform.enter("do_create").await?;
        // a retried step must not provision twice
        if ctx.ext_id.is_none() {
            let ext_id = platform.add_remote(&self.resource_type, &ctx.name, None);
            platform.set_remote_attributes(&ext_id, ctx.params.clone());
            ctx.ext_id = Some(ext_id);
        }
        ctx.attribute = ctx.params.clone();
        Ok(ctx)
    }

    async fn post_create(
        &self,
        session: &ContainerSession,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        self.client(session)?.platform().enter("post_create").await?;
        Ok(ctx)
    }
}

#[async_trait]
impl Importable for FakeResourcePlugin {
    async fn do_import(
        &self,
        session: &ContainerSession,
        mut ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        let platform = self.client(session)?.platform();
        platform.enter("do_import").await?;
        let ext_id = ctx.ext_id.clone().unwrap_or_default();
        let entity = platform.remote(&ext_id).ok_or_else(|| {
            CoreError::remote(&self.resource_type, format!("{ext_id} does not exist remotely"))
        })?;
        ctx.attribute = entity.attributes;
        Ok(ctx)
    }

    async fn post_import(
        &self,
        session: &ContainerSession,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        self.client(session)?.platform().enter("post_import").await?;
        Ok(ctx)
    }
}

#[async_trait]
impl Updatable for FakeResourcePlugin {
    async fn do_update(
        &self,
        session: &ContainerSession,
        mut ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        let platform = self.client(session)?.platform();
        platform.enter("do_update").await?;
        if let Some(ext_id) = &ctx.ext_id {
            platform.rename_remote(ext_id, &ctx.name);
        }
        if let Some(fields) = ctx.params.get("attribute").cloned() {
            merge_attribute(&mut ctx.attribute, &fields);
        }
        Ok(ctx)
    }

    async fn do_patch(
        &self,
        session: &ContainerSession,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        let platform = self.client(session)?.platform();
        platform.enter("do_patch").await?;
        if let Some(ext_id) = &ctx.ext_id {
            platform.set_remote_attributes(ext_id, ctx.attribute.clone());
        }
        Ok(ctx)
    }
}

#[async_trait]
impl Deletable for FakeResourcePlugin {
    async fn do_delete(
        &self,
        session: &ContainerSession,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        let platform = self.client(session)?.platform();
        platform.enter("do_delete").await?;
        if let Some(ext_id) = &ctx.ext_id {
            platform.remove_remote(ext_id);
        }
        Ok(ctx)
    }

    async fn do_expunge(
        &self,
        session: &ContainerSession,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        let platform = self.client(session)?.platform();
        platform.enter("do_expunge").await?;
        if let Some(ext_id) = &ctx.ext_id {
            platform.remove_remote(ext_id);
        }
        Ok(ctx)
    }
}

#[async_trait]
impl Actionable for FakeResourcePlugin {
    fn actions(&self) -> Vec<String> {
        vec!["start".to_string(), "stop".to_string()]
    }

    async fn do_action(
        &self,
        session: &ContainerSession,
        mut ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        self.client(session)?.platform().enter("do_action").await?;
        let power = match ctx.action.as_deref() {
            Some("start") => "on",
            _ => "off",
        };
        merge_attribute(&mut ctx.attribute, &json!({ "power": power }));
        Ok(ctx)
    }
}

#[async_trait]
impl Discoverable for FakeResourcePlugin {
    async fn discover_new(
        &self,
        session: &ContainerSession,
        ext_id_hint: Option<&str>,
        known_ext_ids: &HashSet<String>,
    ) -> CoreResult<Vec<DiscoveredEntity>> {
        let platform = self.client(session)?.platform();
        platform.enter("discover_new").await?;
        Ok(platform
            .remote_of_type(&self.resource_type)
            .into_iter()
            .filter(|entity| !known_ext_ids.contains(&entity.ext_id))
            .filter(|entity| ext_id_hint.map_or(true, |hint| entity.ext_id == hint))
            .map(|entity| DiscoveredEntity {
                resource_type: entity.resource_type,
                ext_id: entity.ext_id,
                parent_ext_id: entity.parent_ext_id,
                kind: "fake".to_string(),
                name: entity.name,
                level: entity.level,
            })
            .collect())
    }

    async fn discover_died(&self, session: &ContainerSession) -> CoreResult<Vec<RemoteEntity>> {
        let platform = self.client(session)?.platform();
        platform.enter("discover_died").await?;
        Ok(platform
            .remote_of_type(&self.resource_type)
            .into_iter()
            .map(|entity| RemoteEntity {
                ext_id: entity.ext_id,
                name: entity.name,
                attributes: entity.attributes,
            })
            .collect())
    }

    async fn synchronize(
        &self,
        _container: &Container,
        entity: &DiscoveredEntity,
    ) -> CoreResult<SyncedResource> {
        self.platform.enter("synchronize").await?;
        let attribute = self
            .platform
            .remote(&entity.ext_id)
            .map_or_else(|| json!({}), |remote| remote.attributes);
        Ok(SyncedResource {
            name: entity.name.clone(),
            desc: format!("discovered {}", entity.kind),
            ext_id: entity.ext_id.clone(),
            parent_ext_id: entity.parent_ext_id.clone(),
            attribute,
        })
    }
}

/// Control plane over the in-memory gateway with `Fake.Network` and `Fake.Server`
/// registered and one active `Fake` container
pub struct TestHarness {
    pub plane: ControlPlane,
    pub services: CoreServices,
    pub platform: Arc<FakePlatform>,
    pub container: Container,
}

impl TestHarness {
    pub const NETWORK: &'static str = "Fake.Network";
    pub const SERVER: &'static str = "Fake.Server";

    pub async fn new() -> Self {
        Self::with_config(Self::test_config()).await
    }

    pub fn test_config() -> CoreConfig {
        let mut config = CoreConfig {
            environment: "test".to_string(),
            ..CoreConfig::default()
        };
        config.executor.workers = 4;
        config.executor.max_step_attempts = 3;
        config.executor.retry_backoff_ms = 1;
        config
    }

    pub async fn with_config(config: CoreConfig) -> Self {
        Self::build(config, Arc::new(AllowAllAuthorizer)).await
    }

    pub async fn with_authorizer(authorizer: Arc<dyn Authorizer>) -> Self {
        Self::build(Self::test_config(), authorizer).await
    }

    async fn build(config: CoreConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        let platform = FakePlatform::new();
        let config = ConfigManager::from_config(config).expect("test config is valid");
        let plane = ControlPlane::builder(config)
            .authorizer(authorizer)
            .driver(Arc::new(FakeDriver::new(platform.clone())))
            .expect("driver registers")
            .resource_type(Arc::new(FakeResourcePlugin::new(
                Self::NETWORK,
                platform.clone(),
            )))
            .expect("network type registers")
            .resource_type(Arc::new(FakeResourcePlugin::new(
                Self::SERVER,
                platform.clone(),
            )))
            .expect("server type registers")
            .build()
            .expect("control plane builds");

        let container = plane
            .containers()
            .add_container(ContainerRequest {
                name: "fake-region".to_string(),
                desc: "test container".to_string(),
                category: "Private".to_string(),
                container_type: FakeDriver::CONTAINER_TYPE.to_string(),
                implementation_class: FakeDriver::IMPLEMENTATION_CLASS.to_string(),
                connection: json!({"endpoint": "fake://region-1"}),
            })
            .await
            .expect("fake container activates");

        Self {
            services: plane.services().clone(),
            plane,
            platform,
            container,
        }
    }

    /// Insert a bare `PENDING` resource straight through the gateway
    pub async fn pending_resource(&self, name: &str) -> Resource {
        self.services
            .gateway
            .add_resource(NewResource {
                objid: objid::child_of(&self.container.objid),
                name: name.to_string(),
                desc: String::new(),
                resource_type: Self::SERVER.to_string(),
                implementation_class: format!("cloudmgr.fake.{}", Self::SERVER),
                container_id: self.container.id,
                parent_id: None,
                ext_id: String::new(),
                state: ResourceState::Pending,
                active: false,
                attribute: json!({}),
            })
            .await
            .expect("resource insert")
    }

    /// Create a resource synchronously through the dispatcher
    pub async fn create(
        &self,
        resource_type: &str,
        name: &str,
        parent: Option<&Resource>,
    ) -> Resource {
        let mut request = CreateRequest::new(resource_type, self.container.id, name).sync(true);
        if let Some(parent) = parent {
            request = request.with_parent(parent.id);
        }
        let outcome = self
            .plane
            .dispatcher()
            .create(request)
            .await
            .expect("create succeeds");
        self.resource(&EntityKey::Uuid(outcome.uuid())).await
    }

    /// Fresh read, bypassing the cache
    pub async fn resource(&self, key: &EntityKey) -> Resource {
        self.services
            .resources
            .get(key, false)
            .await
            .expect("resource exists")
    }

    pub async fn try_resource(&self, key: &EntityKey) -> CoreResult<Resource> {
        self.services.resources.get(key, false).await
    }
}
