//! Render-surface panel primitives provided by the host.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::SurfaceMessage;

/// Where a new panel opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    Active,
    Beside,
}

/// Options for [`PanelHost::create_panel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelOptions {
    pub view_type: String,
    pub title: String,
    pub placement: Placement,
    pub enable_scripts: bool,
    pub retain_context_when_hidden: bool,
}

impl PanelOptions {
    pub fn new(view_type: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            view_type: view_type.into(),
            title: title.into(),
            placement: Placement::Active,
            enable_scripts: true,
            retain_context_when_hidden: true,
        }
    }
}

/// Notifications coming from a panel.
#[derive(Debug, Clone, PartialEq)]
pub enum PanelEvent {
    Message(SurfaceMessage),
    VisibilityChanged(bool),
    /// The panel was closed. No further events follow.
    Disposed,
}

/// A live render surface.
#[async_trait]
pub trait RenderPanel: Send + Sync {
    /// Post a message to the surface. Fails if the surface is gone.
    async fn post_message(&self, message: &SurfaceMessage) -> anyhow::Result<()>;

    /// Take the panel's event stream. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PanelEvent>>;

    /// Close the panel.
    fn dispose(&self);
}

/// Factory for render panels.
#[async_trait]
pub trait PanelHost: Send + Sync {
    async fn create_panel(&self, options: &PanelOptions) -> anyhow::Result<Arc<dyn RenderPanel>>;
}

/// Panel host for runs without any render surface. Every create fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessPanelHost;

#[async_trait]
impl PanelHost for HeadlessPanelHost {
    async fn create_panel(&self, options: &PanelOptions) -> anyhow::Result<Arc<dyn RenderPanel>> {
        anyhow::bail!("cannot open `{}`: no render surface in headless mode", options.view_type)
    }
}
