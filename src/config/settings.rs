//! Runtime settings

use std::time::Duration;
use uuid::Uuid;

use crate::config::CliArgs;
use crate::core::{discovery::DiscoveryConfig, scanner::ScanOptions};

/// How the target peripheral is named on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPeripheral {
    Address(String),
    Name(String),
}

impl TargetPeripheral {
    fn parse(target: String) -> Self {
        let is_address = target.len() == 17
            && target
                .split(':')
                .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()));
        if is_address {
            TargetPeripheral::Address(target.to_ascii_uppercase())
        } else {
            TargetPeripheral::Name(target)
        }
    }

    pub fn matches(&self, address: &str, name: Option<&str>) -> bool {
        match self {
            TargetPeripheral::Address(target) => target.eq_ignore_ascii_case(address),
            TargetPeripheral::Name(target) => name == Some(target.as_str()),
        }
    }
}

/// Runtime configuration settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub adapter: Option<String>,
    pub services: Vec<Uuid>,
    pub characteristics: Vec<Uuid>,
    pub scan_timeout: Option<Duration>,
    pub allow_duplicates: bool,
    pub target: Option<TargetPeripheral>,
    pub auto_reconnect: bool,
    pub descriptors: bool,
    pub read: bool,
    pub subscribe: bool,
    pub json: bool,
}

impl Settings {
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            services: self.services.clone(),
            dedupe: !self.allow_duplicates,
            timeout: self.scan_timeout,
        }
    }

    /// Discovery run after connecting; the scan filter doubles as the
    /// service filter
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            services: self.services.clone(),
            characteristics: self.characteristics.clone(),
            descriptors: self.descriptors,
        }
    }
}

impl From<CliArgs> for Settings {
    fn from(args: CliArgs) -> Self {
        let scan_timeout = (args.scan_timeout > 0).then(|| Duration::from_secs(args.scan_timeout));

        Settings {
            adapter: args.adapter,
            services: args.services,
            characteristics: args.characteristics,
            scan_timeout,
            allow_duplicates: args.allow_duplicates,
            target: args.connect.map(TargetPeripheral::parse),
            auto_reconnect: args.auto_reconnect,
            descriptors: args.descriptors,
            read: args.read,
            subscribe: args.subscribe,
            json: args.json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let settings = Settings::from(CliArgs::parse_from(["ble-central"]));

        assert_eq!(settings.scan_timeout, Some(Duration::from_secs(30)));
        assert!(settings.target.is_none());
        assert!(settings.scan_options().dedupe);
        assert_eq!(settings.discovery_config(), DiscoveryConfig::default());
    }

    #[test]
    fn test_filters_and_target() {
        let settings = Settings::from(CliArgs::parse_from([
            "ble-central",
            "--service",
            "181c",
            "--characteristic",
            "00002a99-0000-1000-8000-00805f9b34fb",
            "--scan-timeout",
            "0",
            "--allow-duplicates",
            "--connect",
            "aa:bb:cc:dd:ee:ff",
            "--descriptors",
        ]));

        assert_eq!(settings.services, vec![crate::uuids::USER_DATA_SERVICE_UUID]);
        assert_eq!(
            settings.characteristics,
            vec![crate::uuids::DATABASE_CHANGE_INCREMENT_UUID]
        );
        assert_eq!(settings.scan_timeout, None);
        assert!(!settings.scan_options().dedupe);
        assert!(settings.discovery_config().descriptors);
        assert_eq!(
            settings.target,
            Some(TargetPeripheral::Address("AA:BB:CC:DD:EE:FF".into()))
        );
    }

    #[test]
    fn test_target_by_name() {
        let target = TargetPeripheral::parse("Thermometer".into());
        assert!(target.matches("AA:BB:CC:DD:EE:FF", Some("Thermometer")));
        assert!(!target.matches("AA:BB:CC:DD:EE:FF", None));

        let target = TargetPeripheral::parse("aa:bb:cc:dd:ee:ff".into());
        assert!(target.matches("AA:BB:CC:DD:EE:FF", Some("Other")));
    }

    #[test]
    fn test_invalid_uuid_rejected() {
        assert!(CliArgs::try_parse_from(["ble-central", "--service", "xyz"]).is_err());
    }
}
