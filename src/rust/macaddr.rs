// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::eui48;
use ::std::fmt;

//==============================================================================
// Structures
//==============================================================================

/// Link-layer address of an ethernet endpoint.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(eui48::MacAddress);

//==============================================================================
// Associate Functions
//==============================================================================

impl MacAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        MacAddress(eui48::MacAddress::new(bytes))
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        MacAddress(eui48::MacAddress::from_bytes(bytes).unwrap())
    }

    pub fn parse_str(s: &str) -> Result<Self, eui48::ParseError> {
        Ok(MacAddress(eui48::MacAddress::parse_str(s)?))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0.to_array()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn broadcast() -> MacAddress {
        MacAddress(eui48::MacAddress::broadcast())
    }

    pub fn is_broadcast(&self) -> bool {
        self.0.is_broadcast()
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.to_canonical())
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MacAddress({})", &self.0.to_canonical())
    }
}
