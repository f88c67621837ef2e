//! Endpoint identifiers.
//!
//! The `ipn` scheme (`ipn:node.service`) is the native scheme of the
//! stack; it compresses to two numbers on the wire. `dtn:none` is the
//! null endpoint.

use crate::tools::error::{DtnError, Result};

/// A parsed, scheme-qualified endpoint id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Eid {
    /// CBHE-compressible `ipn:node.service`
    Ipn {
        /// Node number
        node: u64,
        /// Service number
        service: u64,
    },
    /// The null endpoint, `dtn:none`
    None,
}

impl Eid {
    /// The null endpoint.
    pub const NULL: Eid = Eid::None;

    /// Construct an `ipn` EID.
    pub fn ipn(node: u64, service: u64) -> Eid {
        Eid::Ipn { node, service }
    }

    /// Parse an EID string.
    pub fn parse(text: &str) -> Result<Eid> {
        let url = url::Url::parse(text)
            .map_err(|e| DtnError::new(format!("Malformed EID {:?}: {}", text, e)))?;
        match url.scheme() {
            "ipn" => {
                let path = url.path();
                let (node, service) = path
                    .split_once('.')
                    .ok_or_else(|| DtnError::new(format!("Malformed ipn EID {:?}", text)))?;
                let node: u64 = node
                    .parse()
                    .map_err(|_| DtnError::new(format!("Bad node number in {:?}", text)))?;
                let service: u64 = service
                    .parse()
                    .map_err(|_| DtnError::new(format!("Bad service number in {:?}", text)))?;
                if node == 0 {
                    return Err(DtnError::new("Node number 0 is reserved"));
                }
                Ok(Eid::Ipn { node, service })
            }
            "dtn" if url.path() == "none" => Ok(Eid::None),
            scheme => Err(DtnError::new(format!("Unknown EID scheme {:?}", scheme))),
        }
    }

    /// Node number, if this is an `ipn` EID.
    pub fn node(&self) -> Option<u64> {
        match self {
            Eid::Ipn { node, .. } => Some(*node),
            Eid::None => None,
        }
    }

    /// Service number, if this is an `ipn` EID.
    pub fn service(&self) -> Option<u64> {
        match self {
            Eid::Ipn { service, .. } => Some(*service),
            Eid::None => None,
        }
    }

    /// The CBHE pair (node, service); the null endpoint encodes as (0, 0).
    pub fn cbhe(&self) -> (u64, u64) {
        match self {
            Eid::Ipn { node, service } => (*node, *service),
            Eid::None => (0, 0),
        }
    }

    /// Rebuild from a CBHE pair.
    pub fn from_cbhe(node: u64, service: u64) -> Eid {
        if node == 0 {
            Eid::None
        } else {
            Eid::Ipn { node, service }
        }
    }
}

impl std::fmt::Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Eid::Ipn { node, service } => write!(f, "ipn:{}.{}", node, service),
            Eid::None => write!(f, "dtn:none"),
        }
    }
}

impl std::str::FromStr for Eid {
    type Err = DtnError;

    fn from_str(s: &str) -> Result<Eid> {
        Eid::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipn() {
        assert_eq!(Eid::parse("ipn:5.12").unwrap(), Eid::ipn(5, 12));
        assert_eq!(Eid::parse("ipn:1.0").unwrap(), Eid::ipn(1, 0));
    }

    #[test]
    fn test_parse_null() {
        assert_eq!(Eid::parse("dtn:none").unwrap(), Eid::None);
    }

    #[test]
    fn test_reject_malformed() {
        assert!(Eid::parse("ipn:5").is_err());
        assert!(Eid::parse("ipn:x.y").is_err());
        assert!(Eid::parse("ipn:0.1").is_err());
        assert!(Eid::parse("mailto:a@b").is_err());
        assert!(Eid::parse("not an eid").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["ipn:5.12", "dtn:none"] {
            assert_eq!(Eid::parse(text).unwrap().to_string(), text);
        }
    }
}
