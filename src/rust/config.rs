// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    fail::Fail,
    macaddr::MacAddress,
};
use ::std::fs;
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//==============================================================================
// Structures
//==============================================================================

/// Datapath configuration, backed by a YAML document. All datapath keys
/// live under the `mlx5` section.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//==============================================================================
// Associate Functions
//==============================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let text = fs::read_to_string(config_path)
            .map_err(|e| Fail::new(libc::EINVAL, &format!("cannot read config file: {:?}", e)))?;
        let mut docs = YamlLoader::load_from_str(&text)
            .map_err(|e| Fail::new(libc::EINVAL, &format!("cannot parse config file: {:?}", e)))?;
        if docs.is_empty() {
            return Err(Fail::new(libc::EINVAL, "empty config file"));
        }
        Ok(Self(docs.swap_remove(0)))
    }

    /// Reads the PCI address of the NIC from the underlying configuration file.
    pub fn pci_addr(&self) -> Result<String, Fail> {
        if let Some(pci_addr) = self.0["mlx5"]["pci_addr"].as_str() {
            Ok(pci_addr.to_string())
        } else {
            Err(Fail::new(libc::EINVAL, "missing mlx5.pci_addr in config"))
        }
    }

    /// Reads the local link-layer address from the underlying configuration file.
    pub fn local_mac_addr(&self) -> Result<MacAddress, Fail> {
        let mac_str = self.0["mlx5"]["mac_addr"]
            .as_str()
            .ok_or_else(|| anyhow::format_err!("missing mlx5.mac_addr in config"))
            .map_err(|e| Fail::new(libc::EINVAL, &format!("{}", e)))?;
        MacAddress::parse_str(mac_str).map_err(|e| Fail::new(libc::EINVAL, &format!("bad mac_addr: {:?}", e)))
    }

    /// Reads the device backend name; defaults to the emulated backend when
    /// the key is absent.
    pub fn backend(&self) -> String {
        match self.0["mlx5"]["backend"].as_str() {
            Some(b) => b.to_string(),
            None => "emulated".to_string(),
        }
    }

    /// Reads the number of datapath threads; defaults to one.
    pub fn num_threads(&self) -> usize {
        match self.0["mlx5"]["num_threads"].as_i64() {
            Some(n) if n > 0 => n as usize,
            _ => 1,
        }
    }
}
