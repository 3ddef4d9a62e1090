//! Interception bridge.
//!
//! When the server is embedded in a browser-automation host that can
//! intercept a page's outbound requests, the bridge installs a hook that
//! redirects requests matching any mapping to `http://127.0.0.1:<port>`.
//! Without a host the bridge does nothing.

use crate::matcher::RequestDescriptor;
use crate::store::SnapshotHandle;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;
use url::Url;

/// An outbound request issued by a page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub body: Option<String>,
}

impl OutboundRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    fn descriptor(&self) -> RequestDescriptor {
        RequestDescriptor::new(
            &self.method,
            self.url.clone(),
            self.body.as_deref().map(str::as_bytes),
        )
    }
}

/// Host-provided context for the intercepted request.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub page_url: Option<String>,
}

/// Lets a hook change where an intercepted request goes.
pub trait RequestController {
    fn change_url(&mut self, new_url: String);
}

/// Interception callback registered with the host.
pub type InterceptHook =
    Arc<dyn Fn(&HookContext, &OutboundRequest, &mut dyn RequestController) + Send + Sync>;

/// Registration point for the host's interception hook.
pub trait InterceptionHost: Send + Sync {
    fn current_hook(&self) -> Option<InterceptHook>;
    fn set_hook(&self, hook: Option<InterceptHook>);
}

/// Minimal in-process [`InterceptionHost`].
#[derive(Default)]
pub struct HookSlot {
    hook: RwLock<Option<InterceptHook>>,
}

impl HookSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.hook.read().is_none()
    }

    /// Run the registered hook for `request` and return the URL it ended
    /// up being redirected to, if any.
    pub fn dispatch(&self, context: &HookContext, request: &OutboundRequest) -> Option<String> {
        let hook = self.hook.read().clone()?;
        let mut rewrite = UrlRewrite::default();
        hook(context, request, &mut rewrite);
        rewrite.new_url
    }
}

impl InterceptionHost for HookSlot {
    fn current_hook(&self) -> Option<InterceptHook> {
        self.hook.read().clone()
    }

    fn set_hook(&self, hook: Option<InterceptHook>) {
        *self.hook.write() = hook;
    }
}

#[derive(Default)]
struct UrlRewrite {
    new_url: Option<String>,
}

impl RequestController for UrlRewrite {
    fn change_url(&mut self, new_url: String) {
        self.new_url = Some(new_url);
    }
}

struct Installed {
    port: u16,
    previous: Option<InterceptHook>,
}

/// Installs and removes the redirecting hook on an optional host.
pub struct InterceptionBridge {
    host: Option<Arc<dyn InterceptionHost>>,
    mappings: SnapshotHandle,
    installed: Option<Installed>,
}

impl InterceptionBridge {
    pub fn new(host: Option<Arc<dyn InterceptionHost>>, mappings: SnapshotHandle) -> Self {
        Self {
            host,
            mappings,
            installed: None,
        }
    }

    pub fn set_host(&mut self, host: Option<Arc<dyn InterceptionHost>>) {
        self.release();
        self.host = host;
    }

    pub fn has_host(&self) -> bool {
        self.host.is_some()
    }

    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }

    /// Install the hook redirecting to `port`. Already installed for the
    /// same port is a no-op; a different port replaces the hook.
    pub fn install(&mut self, port: u16) {
        let Some(host) = self.host.clone() else {
            return;
        };
        if let Some(installed) = &self.installed {
            if installed.port == port {
                return;
            }
        }
        self.release();

        let previous = host.current_hook();
        host.set_hook(Some(redirect_hook(
            previous.clone(),
            self.mappings.clone(),
            port,
        )));
        self.installed = Some(Installed { port, previous });
        info!(port, "Interception hook installed");
    }

    /// Remove the hook and restore whatever the host had before. Idempotent.
    pub fn release(&mut self) {
        let (Some(host), Some(installed)) = (&self.host, self.installed.take()) else {
            return;
        };
        host.set_hook(installed.previous);
        info!(port = installed.port, "Interception hook released");
    }
}

impl Drop for InterceptionBridge {
    fn drop(&mut self) {
        self.release();
    }
}

fn redirect_hook(
    previous: Option<InterceptHook>,
    mappings: SnapshotHandle,
    port: u16,
) -> InterceptHook {
    Arc::new(
        move |context: &HookContext,
              request: &OutboundRequest,
              controller: &mut dyn RequestController| {
            if let Some(previous) = &previous {
                previous(context, request, &mut *controller);
            }

            let descriptor = request.descriptor();
            let snapshot = mappings.load();
            let patterns = snapshot
                .entries
                .iter()
                .map(|e| &e.pattern)
                .chain(snapshot.pending.iter());

            // Every matching pattern rewrites; the last one wins.
            for pattern in patterns {
                if pattern.matches(&descriptor) {
                    let new_url = redirect_url(&request.url, port);
                    info!(from = %request.url, to = %new_url, "Redirecting outbound request");
                    controller.change_url(new_url);
                }
            }
        },
    )
}

/// Point `original` at the local server, keeping path and query.
pub fn redirect_url(original: &str, port: u16) -> String {
    let path_and_query = match Url::parse(original) {
        Ok(url) => match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        },
        Err(_) if original.starts_with('/') => original.to_string(),
        Err(_) => format!("/{}", original),
    };
    format!("http://127.0.0.1:{}{}", port, path_and_query)
}
