use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::Display;

pub const DEFAULT_MANIFEST: &str =
  r#"{"version":"1.0","services":{"web":{}}}"#;

/// Key of the image injected when services build from the
/// project's own Dockerfile without declaring one.
pub const DEFAULT_IMAGE_KEY: &str = "default";

/// Manifest validation failure, pointing at the offending field.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid manifest at '{path}': {message}")]
pub struct InvalidManifest {
  pub path: String,
  pub message: String,
}

impl InvalidManifest {
  fn new(
    path: impl Into<String>,
    message: impl Into<String>,
  ) -> InvalidManifest {
    InvalidManifest {
      path: path.into(),
      message: message.into(),
    }
  }
}

/// The parsed `disco.json` document.
///
/// Parsing is total: [DiscoFile::parse] either returns a manifest with
/// every invariant checked, or an [InvalidManifest] naming the field
/// that broke one. Field order of `services` / `images` is preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoFile {
  pub version: String,
  #[serde(default)]
  pub services: IndexMap<String, Service>,
  #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
  pub images: IndexMap<String, Image>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
  #[serde(default, rename = "type")]
  pub service_type: ServiceType,
  /// Directory copied into the static docroot, for `static` services.
  #[serde(default = "default_public_path")]
  pub public_path: String,
  /// Key into [DiscoFile::images].
  #[serde(default = "default_image_key")]
  pub image: String,
  /// Container port traffic is routed to when this service is the
  /// `web` service.
  #[serde(default = "default_port")]
  pub port: u16,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub command: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub published_ports: Vec<PublishedPort>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub volumes: Vec<VolumeMount>,
  /// Cron expression, only meaningful for `cron` services.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub schedule: Option<String>,
  #[serde(default)]
  pub exposed_internally: bool,
  /// Seconds before command / generator / cron executions are killed.
  #[serde(default = "default_timeout")]
  pub timeout: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub health: Option<Health>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub resources: Option<Resources>,
}

impl Default for Service {
  fn default() -> Service {
    Service {
      service_type: Default::default(),
      public_path: default_public_path(),
      image: default_image_key(),
      port: default_port(),
      command: None,
      published_ports: Vec::new(),
      volumes: Vec::new(),
      schedule: None,
      exposed_internally: false,
      timeout: default_timeout(),
      health: None,
      resources: None,
    }
  }
}

fn default_public_path() -> String {
  String::from("dist")
}

fn default_image_key() -> String {
  String::from(DEFAULT_IMAGE_KEY)
}

fn default_port() -> u16 {
  8000
}

fn default_timeout() -> u64 {
  300
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Display,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceType {
  #[default]
  Container,
  Static,
  Generator,
  Command,
  Cron,
  Cgi,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedPort {
  pub published_as: u16,
  pub from_container_port: u16,
  #[serde(default)]
  pub protocol: PortProtocol,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Display,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PortProtocol {
  #[default]
  Tcp,
  Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
  pub name: String,
  pub destination_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
  pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cpu_limit: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cpu_reservation: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub memory_limit: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub memory_reservation: Option<String>,
}

/// A buildable or pullable image referenced by services.
#[derive(
  Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Image {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub dockerfile: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub context: Option<String>,
  /// Registry pin. When set, nothing is built and docker pulls
  /// the image when the service is created.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pull: Option<String>,
}

impl Image {
  pub fn dockerfile(&self) -> &str {
    self.dockerfile.as_deref().unwrap_or("Dockerfile")
  }

  pub fn context(&self) -> &str {
    self.context.as_deref().unwrap_or(".")
  }
}

impl DiscoFile {
  /// Parse and validate manifest bytes.
  pub fn parse(contents: &str) -> Result<DiscoFile, InvalidManifest> {
    let mut manifest: DiscoFile = serde_json::from_str(contents)
      .map_err(|e| InvalidManifest::new("", e.to_string()))?;
    manifest.validate()?;
    if manifest.should_add_default_image() {
      manifest.images.insert(
        default_image_key(),
        Image {
          dockerfile: Some(String::from("Dockerfile")),
          context: Some(String::from(".")),
          pull: None,
        },
      );
    }
    Ok(manifest)
  }

  /// The manifest used when a project has no `disco.json`:
  /// a single containerized `web` service on port 8000.
  pub fn default_manifest() -> DiscoFile {
    DiscoFile::parse(DEFAULT_MANIFEST)
      .expect("default manifest is valid")
  }

  pub fn web(&self) -> Option<&Service> {
    self.services.get("web")
  }

  /// The image record for a service, falling back to a
  /// build-from-Dockerfile default when the key is undeclared.
  pub fn image_for_service(&self, service: &Service) -> Image {
    self.images.get(&service.image).cloned().unwrap_or_default()
  }

  fn validate(&self) -> Result<(), InvalidManifest> {
    for (name, service) in &self.services {
      if let Some(schedule) = &service.schedule {
        <croner::Cron as std::str::FromStr>::from_str(schedule).map_err(|e| {
          InvalidManifest::new(
            format!("services.{name}.schedule"),
            format!("invalid cron expression: {e}"),
          )
        })?;
      }
      if service.service_type == ServiceType::Cron
        && service.schedule.is_none()
      {
        return Err(InvalidManifest::new(
          format!("services.{name}.schedule"),
          "cron services require a schedule",
        ));
      }
      if let Some(resources) = &service.resources {
        validate_resources(name, resources)?;
      }
    }
    Ok(())
  }

  /// A synthetic `default` image is only injected when some service
  /// both references it and will actually execute. A pure static site
  /// with no build command never triggers injection.
  fn should_add_default_image(&self) -> bool {
    if self.images.contains_key(DEFAULT_IMAGE_KEY) {
      return false;
    }
    self.services.values().any(|service| {
      service.image == DEFAULT_IMAGE_KEY
        && !(service.service_type == ServiceType::Static
          && service.command.is_none())
    })
  }
}

fn validate_resources(
  service: &str,
  resources: &Resources,
) -> Result<(), InvalidManifest> {
  for (field, value) in [
    ("cpuLimit", resources.cpu_limit),
    ("cpuReservation", resources.cpu_reservation),
  ] {
    if let Some(cpu) = value
      && cpu <= 0.0
    {
      return Err(InvalidManifest::new(
        format!("services.{service}.resources.{field}"),
        "CPU value must be positive",
      ));
    }
  }
  let mut bytes = [None, None];
  for (i, (field, value)) in [
    ("memoryLimit", &resources.memory_limit),
    ("memoryReservation", &resources.memory_reservation),
  ]
  .into_iter()
  .enumerate()
  {
    if let Some(memory) = value {
      bytes[i] = Some(memory_to_bytes(memory).ok_or_else(|| {
        InvalidManifest::new(
          format!("services.{service}.resources.{field}"),
          "memory must be <number><unit> with unit b, k, m or g",
        )
      })?);
    }
  }
  if let (Some(limit), Some(reservation)) = (bytes[0], bytes[1])
    && limit < reservation
  {
    return Err(InvalidManifest::new(
      format!("services.{service}.resources.memoryLimit"),
      "memory limit must be >= memory reservation",
    ));
  }
  if let (Some(limit), Some(reservation)) =
    (resources.cpu_limit, resources.cpu_reservation)
    && limit < reservation
  {
    return Err(InvalidManifest::new(
      format!("services.{service}.resources.cpuLimit"),
      "CPU limit must be >= CPU reservation",
    ));
  }
  Ok(())
}

/// Parse docker-style memory strings (`256m`, `1g`, `512mb`, `1024k`).
pub fn memory_to_bytes(memory: &str) -> Option<u64> {
  let re = memory_regex();
  let captures = re.captures(memory)?;
  let value: u64 = captures[1].parse().ok()?;
  let multiplier = match captures[2].to_ascii_lowercase().as_str() {
    "b" => 1,
    "k" => 1024,
    "m" => 1024 * 1024,
    "g" => 1024 * 1024 * 1024,
    _ => return None,
  };
  Some(value * multiplier)
}

fn memory_regex() -> &'static Regex {
  static MEMORY_REGEX: std::sync::OnceLock<Regex> =
    std::sync::OnceLock::new();
  MEMORY_REGEX.get_or_init(|| {
    Regex::new(r"(?i)^(\d+)([bkmg])b?$")
      .expect("memory regex is valid")
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_default_manifest() {
    let manifest = DiscoFile::default_manifest();
    assert_eq!(manifest.version, "1.0");
    let web = manifest.web().unwrap();
    assert_eq!(web.service_type, ServiceType::Container);
    assert_eq!(web.port, 8000);
    // the web service executes, so the default image is injected
    let image = manifest.images.get(DEFAULT_IMAGE_KEY).unwrap();
    assert_eq!(image.dockerfile(), "Dockerfile");
    assert_eq!(image.context(), ".");
  }

  #[test]
  fn static_site_without_command_gets_no_image() {
    let manifest = DiscoFile::parse(
      r#"{"version":"1.0","services":{"web":{"type":"static","publicPath":"out"}}}"#,
    )
    .unwrap();
    assert!(manifest.images.is_empty());
    assert_eq!(manifest.web().unwrap().public_path, "out");
  }

  #[test]
  fn static_site_with_build_command_gets_image() {
    let manifest = DiscoFile::parse(
      r#"{"version":"1.0","services":{"web":{"type":"static","command":"npm run build"}}}"#,
    )
    .unwrap();
    assert!(manifest.images.contains_key(DEFAULT_IMAGE_KEY));
  }

  #[test]
  fn declared_default_image_is_not_replaced() {
    let manifest = DiscoFile::parse(
      r#"{"version":"1.0","services":{"web":{}},"images":{"default":{"dockerfile":"docker/Dockerfile.web"}}}"#,
    )
    .unwrap();
    assert_eq!(
      manifest.images[DEFAULT_IMAGE_KEY].dockerfile(),
      "docker/Dockerfile.web"
    );
  }

  #[test]
  fn missing_version_is_rejected() {
    let err =
      DiscoFile::parse(r#"{"services":{"web":{}}}"#).unwrap_err();
    assert!(err.message.contains("version"));
  }

  #[test]
  fn unknown_service_type_is_rejected() {
    assert!(
      DiscoFile::parse(
        r#"{"version":"1.0","services":{"web":{"type":"daemonset"}}}"#,
      )
      .is_err()
    );
  }

  #[test]
  fn bad_schedule_is_rejected() {
    let err = DiscoFile::parse(
      r#"{"version":"1.0","services":{"tick":{"type":"cron","command":"true","schedule":"not cron"}}}"#,
    )
    .unwrap_err();
    assert_eq!(err.path, "services.tick.schedule");
  }

  #[test]
  fn cron_without_schedule_is_rejected() {
    assert!(
      DiscoFile::parse(
        r#"{"version":"1.0","services":{"tick":{"type":"cron","command":"true"}}}"#,
      )
      .is_err()
    );
  }

  #[test]
  fn resource_validation() {
    let parse = |resources: &str| {
      DiscoFile::parse(&format!(
        r#"{{"version":"1.0","services":{{"web":{{"resources":{resources}}}}}}}"#,
      ))
    };
    assert!(parse(r#"{"cpuLimit":0.5}"#).is_ok());
    assert!(parse(r#"{"cpuLimit":0}"#).is_err());
    assert!(parse(r#"{"cpuLimit":-1.5}"#).is_err());
    assert!(
      parse(r#"{"cpuLimit":0.5,"cpuReservation":1.0}"#).is_err()
    );
    assert!(parse(r#"{"memoryLimit":"512m"}"#).is_ok());
    assert!(parse(r#"{"memoryLimit":"512mb"}"#).is_ok());
    assert!(parse(r#"{"memoryLimit":"lots"}"#).is_err());
    assert!(
      parse(r#"{"memoryLimit":"1g","memoryReservation":"512m"}"#)
        .is_ok()
    );
    assert!(
      parse(r#"{"memoryLimit":"512m","memoryReservation":"1g"}"#)
        .is_err()
    );
  }

  #[test]
  fn memory_units() {
    assert_eq!(memory_to_bytes("512b"), Some(512));
    assert_eq!(memory_to_bytes("2k"), Some(2048));
    assert_eq!(memory_to_bytes("1g"), Some(1024 * 1024 * 1024));
    assert_eq!(memory_to_bytes("1G"), Some(1024 * 1024 * 1024));
    assert_eq!(memory_to_bytes("1.5g"), None);
    assert_eq!(memory_to_bytes("g"), None);
  }

  #[test]
  fn round_trips_through_json() {
    let source = r#"{
      "version": "1.0",
      "services": {
        "web": {"port": 3000},
        "worker": {
          "type": "cron",
          "command": "python tick.py",
          "schedule": "*/5 * * * *",
          "volumes": [{"name": "data", "destinationPath": "/data"}]
        }
      },
      "images": {"default": {"dockerfile": "Dockerfile", "context": "."}}
    }"#;
    let manifest = DiscoFile::parse(source).unwrap();
    let reparsed =
      DiscoFile::parse(&serde_json::to_string(&manifest).unwrap())
        .unwrap();
    assert_eq!(manifest, reparsed);
  }

  #[test]
  fn service_order_is_preserved() {
    let manifest = DiscoFile::parse(
      r#"{"version":"1.0","services":{"z":{},"a":{},"m":{}}}"#,
    )
    .unwrap();
    let names: Vec<_> = manifest.services.keys().collect();
    assert_eq!(names, ["z", "a", "m"]);
  }
}
