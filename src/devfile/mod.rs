//! Devfile model and command resolution
//!
//! The devfile itself is parsed elsewhere; this module deserializes the
//! subset the adapter needs and resolves which commands a push runs.

pub mod commands;
mod types;

use std::path::Path;

pub use commands::{
    validate_and_get_debug_command, validate_and_get_push_commands,
    validate_and_get_test_command, PushCommands,
};
pub use types::*;

use crate::error::{Error, Result};

impl Devfile {
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("unable to read devfile {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    pub fn containers(&self) -> impl Iterator<Item = (&str, &ContainerComponent)> {
        self.components
            .iter()
            .filter_map(|c| c.container.as_ref().map(|cont| (c.name.as_str(), cont)))
    }

    pub fn container(&self, name: &str) -> Option<&ContainerComponent> {
        self.containers()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| c)
    }

    pub fn volumes(&self) -> impl Iterator<Item = (&str, &VolumeComponent)> {
        self.components
            .iter()
            .filter_map(|c| c.volume.as_ref().map(|v| (c.name.as_str(), v)))
    }

    pub fn command(&self, id: &str) -> Option<&DevfileCommand> {
        self.commands
            .iter()
            .find(|c| c.id.eq_ignore_ascii_case(id))
    }

    /// Component type label value derived from the devfile metadata name
    pub fn component_type(&self) -> &str {
        self.metadata.name.trim_end_matches('-')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODEJS_DEVFILE: &str = r#"
schemaVersion: 2.0.0
metadata:
  name: nodejs-
components:
  - name: runtime
    container:
      image: node:18
      memoryLimit: 1024Mi
      endpoints:
        - name: http-3000
          targetPort: 3000
      volumeMounts:
        - name: cache
          path: /cache
  - name: cache
    volume:
      size: 2Gi
commands:
  - id: install
    exec:
      component: runtime
      commandLine: npm install
      workingDir: /projects
      group:
        kind: build
        isDefault: true
  - id: run
    exec:
      component: runtime
      commandLine: npm start
      group:
        kind: run
        isDefault: true
events:
  postStart:
    - install
"#;

    #[test]
    fn test_from_yaml_reads_components_commands_and_events() {
        let devfile = Devfile::from_yaml(NODEJS_DEVFILE).unwrap();

        assert_eq!(devfile.containers().count(), 1);
        assert_eq!(devfile.volumes().count(), 1);
        assert_eq!(devfile.commands.len(), 2);
        assert_eq!(devfile.events.post_start, vec!["install".to_string()]);

        let runtime = devfile.container("runtime").unwrap();
        assert!(runtime.mounts_sources());
        assert_eq!(runtime.source_path(), DEFAULT_SOURCE_MAPPING);
        assert_eq!(runtime.endpoints[0].target_port, 3000);
        assert_eq!(runtime.volume_mounts[0].mount_path(), "/cache");
    }

    #[test]
    fn test_command_lookup_ignores_case() {
        let devfile = Devfile::from_yaml(NODEJS_DEVFILE).unwrap();
        let cmd = devfile.command("INSTALL").unwrap();
        assert_eq!(cmd.kind(), Some(CommandGroupKind::Build));
        assert!(cmd.is_default());
        assert_eq!(cmd.component(), Some("runtime"));
    }

    #[test]
    fn test_component_type_trims_trailing_dash() {
        let devfile = Devfile::from_yaml(NODEJS_DEVFILE).unwrap();
        assert_eq!(devfile.component_type(), "nodejs");
    }
}
