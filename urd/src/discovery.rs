//! Service discovery
//!
//! Finds every Kubernetes service, in every namespace, exposed through a cloud
//! load balancer. Discovery runs once per collection cycle and its failure is
//! fatal to the cycle: exporting stale or empty metrics because the API
//! server was unreachable would look like healthy silence.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::{
    Api, Client,
    api::ListParams,
    config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
};
use tracing::{debug, info};

/// The service `type` of services fronted by a cloud load balancer.
pub const LOAD_BALANCER: &str = "LoadBalancer";

/// Errors produced by [`Discover`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The kubeconfig could not be read or understood.
    #[error("Failed to load kubeconfig {path:?}: {source}")]
    Kubeconfig {
        /// Path to the kubeconfig.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: KubeconfigError,
    },
    /// Error produced by the kube client.
    #[error("Kubernetes client error: {0}")]
    Kube(#[from] kube::Error),
    /// A namespace without a name came back from the API server.
    #[error("API server returned a namespace with no name")]
    UnnamedNamespace,
}

/// A discovered load-balanced service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    /// Namespace of the service.
    pub namespace: String,
    /// Name of the service.
    pub name: String,
    /// DNS name of the load balancer, absent while it is being provisioned.
    pub public_hostname: Option<String>,
}

#[async_trait]
/// A source of load-balanced services.
pub trait Discover: Send + Sync {
    /// List every load-balanced service across all namespaces.
    ///
    /// # Errors
    ///
    /// Any failure to talk to the orchestrator is returned; partial results
    /// are never returned.
    async fn services(&self) -> Result<Vec<ServiceRef>, Error>;
}

/// Build a [`ServiceRef`] for `service` if it is of type `LoadBalancer`.
///
/// The public hostname is that of the first ingress point that has one.
#[must_use]
pub fn load_balanced(service: &Service) -> Option<ServiceRef> {
    let spec = service.spec.as_ref()?;
    if spec.type_.as_deref() != Some(LOAD_BALANCER) {
        return None;
    }

    let public_hostname = service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.iter().find_map(|point| point.hostname.clone()));

    Some(ServiceRef {
        namespace: service.metadata.namespace.clone().unwrap_or_default(),
        name: service.metadata.name.clone().unwrap_or_default(),
        public_hostname,
    })
}

/// Discovery against a Kubernetes API server.
#[derive(Clone)]
pub struct Kubernetes {
    client: Client,
}

impl fmt::Debug for Kubernetes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kubernetes").finish_non_exhaustive()
    }
}

impl Kubernetes {
    /// Create a new [`Kubernetes`] over an existing `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create a new [`Kubernetes`] from the kubeconfig at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the kubeconfig cannot be read or parsed, or if a
    /// client cannot be built from it.
    pub async fn from_kubeconfig(path: &Path) -> Result<Self, Error> {
        let kubeconfig_error = |source| Error::Kubeconfig {
            path: path.to_path_buf(),
            source,
        };

        debug!("Loading kubeconfig from {}", path.display());
        let kubeconfig = Kubeconfig::read_from(path).map_err(kubeconfig_error)?;
        let config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(kubeconfig_error)?;
        let client = Client::try_from(config)?;
        info!("Kubernetes client configured from {}", path.display());
        Ok(Self::new(client))
    }
}

#[async_trait]
impl Discover for Kubernetes {
    async fn services(&self) -> Result<Vec<ServiceRef>, Error> {
        let params = ListParams::default();
        let namespaces = Api::<Namespace>::all(self.client.clone())
            .list(&params)
            .await?;

        let mut services = Vec::new();
        for namespace in namespaces {
            let name = namespace.metadata.name.ok_or(Error::UnnamedNamespace)?;
            let listed = Api::<Service>::namespaced(self.client.clone(), &name)
                .list(&params)
                .await?;
            let before = services.len();
            services.extend(listed.iter().filter_map(load_balanced));
            debug!(
                "namespace {name}: {} load-balanced services",
                services.len() - before
            );
        }
        Ok(services)
    }
}
