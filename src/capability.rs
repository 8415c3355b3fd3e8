//! Device capability detection.
//!
//! Decides whether a ceremony should hint for the on-device (platform)
//! authenticator or for a cross-device flow such as scan-to-link. The PRF
//! heuristics are data: a [`CapabilityTable`] of per-client-family minimum
//! versions that can be replaced from configuration without touching the
//! ceremony code.
//!
//! Decision rule: prefer on-device only when the device is handheld, a
//! platform authenticator is present, and that authenticator is known or
//! inferred to support PRF. Anything undetermined falls back to
//! cross-device.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Physical form factor reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormFactor {
    Mobile,
    Tablet,
    Desktop,
    #[default]
    Unknown,
}

impl FormFactor {
    pub fn is_handheld(self) -> bool {
        matches!(self, Self::Mobile | Self::Tablet)
    }
}

/// Which authenticator the ceremony should steer towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticatorHint {
    /// The device's built-in authenticator (biometric unlock on this device).
    Platform,
    /// A secondary device, linked by QR code or proximity.
    CrossDevice,
}

impl AuthenticatorHint {
    /// The WebAuthn `hints` value for this choice.
    pub fn as_webauthn_hint(self) -> &'static str {
        match self {
            Self::Platform => "client-device",
            Self::CrossDevice => "hybrid",
        }
    }
}

/// A dotted numeric version such as `17.4.1`. Missing components compare
/// as zero, so `18` == `18.0.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientVersion(Vec<u32>);

impl ClientVersion {
    fn component(&self, i: usize) -> u32 {
        self.0.get(i).copied().unwrap_or(0)
    }
}

impl FromStr for ClientVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .trim()
            .split('.')
            .map(|p| p.parse::<u32>().map_err(|_| format!("invalid version: {s}")))
            .collect::<Result<Vec<_>, _>>()?;
        if parts.is_empty() {
            return Err(format!("invalid version: {s}"));
        }
        Ok(Self(parts))
    }
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "{}", text.join("."))
    }
}

impl PartialOrd for ClientVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClientVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl Serialize for ClientVersion {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ClientVersion {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// What the client knows about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientProfile {
    pub form_factor: FormFactor,
    /// Client family, e.g. `chrome`, `safari`, `firefox`.
    pub family: String,
    /// Operating system, e.g. `android`, `ios`, `macos`.
    pub os: String,
    pub version: Option<ClientVersion>,
    /// Whether a user-verifying platform authenticator is present.
    pub platform_authenticator: Option<bool>,
    /// PRF support as reported directly by the platform, when it can tell.
    pub prf_supported: Option<bool>,
}

/// One row of the capability table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRule {
    pub family: String,
    /// Restrict the rule to one OS. `None` matches any OS.
    #[serde(default)]
    pub os: Option<String>,
    /// First client version whose platform authenticator supports PRF.
    pub min_version: ClientVersion,
}

impl CapabilityRule {
    fn matches(&self, profile: &ClientProfile) -> bool {
        self.family.eq_ignore_ascii_case(&profile.family)
            && self
                .os
                .as_deref()
                .map_or(true, |os| os.eq_ignore_ascii_case(&profile.os))
    }
}

/// Pluggable strategy for choosing the authenticator hint.
pub trait CapabilityResolver: Send + Sync {
    fn resolve(&self, profile: &ClientProfile) -> AuthenticatorHint;
}

/// Table-driven PRF heuristics keyed by client family, OS and minimum
/// version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTable {
    pub rules: Vec<CapabilityRule>,
}

impl Default for CapabilityTable {
    fn default() -> Self {
        let rule = |family: &str, os: &str, min: &[u32]| CapabilityRule {
            family: family.to_string(),
            os: Some(os.to_string()),
            min_version: ClientVersion(min.to_vec()),
        };
        Self {
            rules: vec![
                rule("chrome", "android", &[116]),
                rule("edge", "android", &[116]),
                rule("samsung", "android", &[24]),
                rule("safari", "ios", &[18]),
                rule("chrome", "ios", &[18]),
                rule("safari", "ipados", &[18]),
                rule("firefox", "android", &[148]),
            ],
        }
    }
}

impl CapabilityTable {
    /// Whether the profile's platform authenticator supports PRF.
    ///
    /// A direct report from the platform wins over the table. `None` means
    /// undetermined: no matching rule, or no version to compare.
    pub fn prf_supported(&self, profile: &ClientProfile) -> Option<bool> {
        if let Some(known) = profile.prf_supported {
            return Some(known);
        }
        let version = profile.version.as_ref()?;
        let rule = self.rules.iter().find(|r| r.matches(profile))?;
        Some(*version >= rule.min_version)
    }
}

impl CapabilityResolver for CapabilityTable {
    fn resolve(&self, profile: &ClientProfile) -> AuthenticatorHint {
        let on_device = profile.form_factor.is_handheld()
            && profile.platform_authenticator == Some(true)
            && self.prf_supported(profile) == Some(true);

        let hint = if on_device {
            AuthenticatorHint::Platform
        } else {
            AuthenticatorHint::CrossDevice
        };
        tracing::debug!(
            family = %profile.family,
            os = %profile.os,
            hint = hint.as_webauthn_hint(),
            "resolved authenticator hint"
        );
        hint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mobile(family: &str, os: &str, version: &str) -> ClientProfile {
        ClientProfile {
            form_factor: FormFactor::Mobile,
            family: family.into(),
            os: os.into(),
            version: Some(version.parse().unwrap()),
            platform_authenticator: Some(true),
            prf_supported: None,
        }
    }

    #[test]
    fn test_version_ordering() {
        let v = |s: &str| s.parse::<ClientVersion>().unwrap();
        assert!(v("18.0") >= v("18"));
        assert!(v("17.4.1") < v("18"));
        assert!(v("116.0.5845") > v("116"));
        assert!("18.x".parse::<ClientVersion>().is_err());
    }

    #[test]
    fn test_supported_mobile_prefers_platform() {
        let table = CapabilityTable::default();
        assert_eq!(
            table.resolve(&mobile("Safari", "iOS", "18.1")),
            AuthenticatorHint::Platform
        );
        assert_eq!(
            table.resolve(&mobile("chrome", "android", "120")),
            AuthenticatorHint::Platform
        );
    }

    #[test]
    fn test_old_version_falls_back_to_cross_device() {
        let table = CapabilityTable::default();
        assert_eq!(
            table.resolve(&mobile("safari", "ios", "17.5")),
            AuthenticatorHint::CrossDevice
        );
    }

    #[test]
    fn test_desktop_and_unknown_clients_use_cross_device() {
        let table = CapabilityTable::default();

        let mut desktop = mobile("chrome", "android", "120");
        desktop.form_factor = FormFactor::Desktop;
        assert_eq!(table.resolve(&desktop), AuthenticatorHint::CrossDevice);

        let unknown = mobile("netsurf", "haiku", "3");
        assert_eq!(table.prf_supported(&unknown), None);
        assert_eq!(table.resolve(&unknown), AuthenticatorHint::CrossDevice);

        let mut no_authenticator = mobile("chrome", "android", "120");
        no_authenticator.platform_authenticator = None;
        assert_eq!(table.resolve(&no_authenticator), AuthenticatorHint::CrossDevice);
    }

    #[test]
    fn test_platform_report_overrides_table() {
        let table = CapabilityTable::default();
        let mut profile = mobile("netsurf", "haiku", "3");
        profile.prf_supported = Some(true);
        assert_eq!(table.resolve(&profile), AuthenticatorHint::Platform);
    }

    #[test]
    fn test_table_loads_from_json() {
        let table: CapabilityTable = serde_json::from_str(
            r#"{ "rules": [ { "family": "brave", "min_version": "1.60" } ] }"#,
        )
        .unwrap();
        assert_eq!(
            table.resolve(&mobile("brave", "android", "1.61.2")),
            AuthenticatorHint::Platform
        );
    }
}
