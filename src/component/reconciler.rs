//! Create-or-update of the component workload

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::context::PushContext;
use super::labels::{owner_reference, selector, STORAGE_LABEL};
use super::resources::{
    available_pvc_name, build_pvc, build_workload, service_port_count, Workload, WorkloadParams,
};
use crate::cluster::WorkloadStore;
use crate::config::Settings;
use crate::devfile::Devfile;
use crate::error::{Error, Result};

pub struct ResourceReconciler<'a> {
    store: &'a dyn WorkloadStore,
    settings: &'a Settings,
}

impl<'a> ResourceReconciler<'a> {
    pub fn new(store: &'a dyn WorkloadStore, settings: &'a Settings) -> Self {
        Self { store, settings }
    }

    /// Bring the deployment, service and claims of the component in line with
    /// the devfile. Returns the deployment as stored by the cluster.
    ///
    /// A failed API call aborts the pass; whatever was already written stays.
    #[instrument(skip(self, ctx, devfile), fields(component = %ctx.component))]
    pub async fn create_or_update(
        &self,
        ctx: &PushContext,
        devfile: &Devfile,
        exists: bool,
    ) -> Result<Deployment> {
        let claims = self.ensure_volume_claims(ctx, devfile).await?;
        let bound_secrets = self.resolve_bound_secrets(&ctx.links).await?;

        let workload = build_workload(&WorkloadParams {
            component: &ctx.component,
            namespace: &ctx.namespace,
            app: &ctx.app,
            devfile,
            commands: &ctx.commands,
            debug_port: ctx.debug_port,
            bound_secrets: &bound_secrets,
            volume_claims: &claims,
            bootstrap_image: &self.settings.bootstrap_image,
        })?;

        if exists {
            self.update(&ctx.component, workload).await
        } else {
            self.create(&ctx.component, workload).await
        }
    }

    async fn create(&self, component: &str, workload: Workload) -> Result<Deployment> {
        let Workload {
            deployment,
            mut service,
        } = workload;

        let deployment = self
            .store
            .create_deployment(&deployment)
            .await
            .map_err(Error::mutation(format!("deployment {component}"), "create"))?;
        info!("Successfully created component {}", component);

        service.metadata.owner_references = Some(vec![owner_reference(&deployment)]);
        if service_port_count(&service) > 0 {
            self.store
                .create_service(&service)
                .await
                .map_err(Error::mutation(format!("service {component}"), "create"))?;
            info!("Successfully created service for component {}", component);
        }
        Ok(deployment)
    }

    async fn update(&self, component: &str, workload: Workload) -> Result<Deployment> {
        let Workload {
            deployment,
            mut service,
        } = workload;

        let deployment = self
            .store
            .update_deployment(&deployment)
            .await
            .map_err(Error::mutation(format!("deployment {component}"), "update"))?;
        info!("Successfully updated component {}", component);

        service.metadata.owner_references = Some(vec![owner_reference(&deployment)]);
        let has_ports = service_port_count(&service) > 0;
        let existing = self
            .store
            .get_service(component)
            .await
            .map_err(Error::mutation(format!("service {component}"), "get"))?;

        match existing {
            Some(old) if has_ports => {
                // A service's clusterIP is immutable
                service.metadata.resource_version = old.metadata.resource_version.clone();
                if let (Some(spec), Some(old_spec)) = (service.spec.as_mut(), old.spec.as_ref()) {
                    spec.cluster_ip = old_spec.cluster_ip.clone();
                }
                self.store
                    .update_service(&service)
                    .await
                    .map_err(Error::mutation(format!("service {component}"), "update"))?;
                info!("Successfully updated service for component {}", component);
            }
            Some(_) => {
                self.store
                    .delete_service(component)
                    .await
                    .map_err(Error::mutation(format!("service {component}"), "delete"))?;
                info!("Deleted service of component {} with no ports", component);
            }
            None if has_ports => {
                self.store
                    .create_service(&service)
                    .await
                    .map_err(Error::mutation(format!("service {component}"), "create"))?;
                info!("Successfully created service for component {}", component);
            }
            None => debug!("component {} exposes no ports, no service", component),
        }
        Ok(deployment)
    }

    /// Map each declared volume to its claim, creating the missing claims of
    /// non-ephemeral volumes. Claims being deleted are ignored.
    async fn ensure_volume_claims(
        &self,
        ctx: &PushContext,
        devfile: &Devfile,
    ) -> Result<BTreeMap<String, String>> {
        let existing = self
            .store
            .list_pvcs(&selector(&ctx.component))
            .await
            .map_err(Error::mutation(
                format!("volume claims of {}", ctx.component),
                "list",
            ))?;

        let mut taken: BTreeSet<String> = existing.iter().map(|pvc| pvc.name_any()).collect();
        let mut claims: BTreeMap<String, String> = existing
            .iter()
            .filter(|pvc| pvc.metadata.deletion_timestamp.is_none())
            .filter_map(|pvc| {
                pvc.labels()
                    .get(STORAGE_LABEL)
                    .map(|volume| (volume.clone(), pvc.name_any()))
            })
            .collect();

        for (volume, spec) in devfile.volumes() {
            if spec.ephemeral || claims.contains_key(volume) {
                continue;
            }
            let size = spec
                .size
                .as_deref()
                .unwrap_or(&self.settings.default_volume_size);
            let mut pvc = build_pvc(&ctx.component, &ctx.namespace, &ctx.app, volume, size);
            let name = available_pvc_name(&ctx.component, volume, &taken);
            pvc.metadata.name = Some(name.clone());
            taken.insert(name);
            let created = self
                .store
                .create_pvc(&pvc)
                .await
                .map_err(Error::mutation(format!("volume claim {}", pvc.name_any()), "create"))?;
            info!("Created volume claim {} for volume {}", created.name_any(), volume);
            claims.insert(volume.to_string(), created.name_any());
        }

        Ok(claims)
    }

    async fn resolve_bound_secrets(&self, links: &[String]) -> Result<Vec<String>> {
        let mut secrets = Vec::with_capacity(links.len());
        for link in links {
            match self.store.bound_secret(link).await? {
                Some(secret) => secrets.push(secret),
                None => return Err(Error::MissingBoundSecret(link.clone())),
            }
        }
        Ok(secrets)
    }
}

/// Make the deployment the owner of every claim of the component that has
/// no owner yet and is not being deleted.
#[instrument(skip(store, deployment), fields(deployment = %deployment.name_any()))]
pub async fn reconcile_volume_ownership(
    store: &dyn WorkloadStore,
    selector: &str,
    deployment: &Deployment,
) -> Result<()> {
    if deployment.metadata.uid.is_none() {
        warn!("deployment has no uid yet, claims keep their owners");
        return Ok(());
    }
    let owner = owner_reference(deployment);
    let pvcs = store
        .list_pvcs(selector)
        .await
        .map_err(Error::mutation(format!("volume claims of {selector}"), "list"))?;

    for pvc in pvcs {
        let owned = pvc
            .metadata
            .owner_references
            .as_ref()
            .is_some_and(|refs| !refs.is_empty());
        if owned || pvc.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let name = pvc.name_any();
        store
            .add_pvc_owner(&name, &owner)
            .await
            .map_err(Error::mutation(format!("volume claim {name}"), "update"))?;
        debug!("claim {} now owned by {}", name, owner.name);
    }
    Ok(())
}
