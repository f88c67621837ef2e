//! Class of service and its dotted-token notation.

use crate::tools::error::{DtnError, Result};

/// Flow label present in the extended class of service.
pub const ECOS_FLOW_LABEL_PRESENT: u32 = 0x01;
/// Best-effort (unreliable) forwarding requested.
pub const ECOS_BEST_EFFORT: u32 = 0x02;
/// Minimum-latency (critical) forwarding requested.
pub const ECOS_MINIMUM_LATENCY: u32 = 0x04;

/// Highest assignable ordinal; 255 is reserved and demoted on send.
pub const MAX_ORDINAL: u8 = 254;

/// Custody disposition requested by the source.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum CustodySwitch {
    /// No custody transfer
    #[default]
    NoCustodyRequested,
    /// The source requires custodial retransmission
    SourceCustodyRequired,
}

/// Extended class of service: latency/reliability flags, ordinal, and an
/// optional flow label.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ExtendedCos {
    /// `ECOS_*` flag bits
    pub flags: u32,
    /// Transmission ordinal, 0..=254 effective
    pub ordinal: u8,
    /// Flow label, meaningful when `ECOS_FLOW_LABEL_PRESENT`
    pub flow_label: u32,
}

impl ExtendedCos {
    /// True if minimum-latency (critical) forwarding is requested.
    pub fn minimum_latency(&self) -> bool {
        self.flags & ECOS_MINIMUM_LATENCY != 0
    }

    /// True if best-effort forwarding is requested.
    pub fn best_effort(&self) -> bool {
        self.flags & ECOS_BEST_EFFORT != 0
    }
}

/// A fully parsed class-of-service request.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ClassOfService {
    /// Priority class 0 (bulk), 1 (standard), or 2 (expedited)
    pub priority: u8,
    /// Custody disposition
    pub custody: CustodySwitch,
    /// Extended class of service
    pub ecos: ExtendedCos,
}

/// Parse a class-of-service token: `custody.priority.ordinal
/// [.unreliable.critical[.flowLabel]]`. Only 2, 3, 5, or 6 fields are
/// accepted.
pub fn parse_class_of_service(token: &str) -> Result<ClassOfService> {
    let fields: Vec<&str> = token.split('.').collect();
    let count = fields.len();
    if !matches!(count, 2 | 3 | 5 | 6) {
        return Err(DtnError::new(format!(
            "Class-of-service token {:?} has {} fields",
            token, count
        )));
    }

    let mut values = Vec::with_capacity(count);
    for field in &fields {
        let v: u32 = field
            .parse()
            .map_err(|_| DtnError::new(format!("Bad class-of-service field {:?}", field)))?;
        values.push(v);
    }

    let custody_requested = values[0];
    let priority = values[1];
    if priority > 2 || custody_requested > 1 {
        return Err(DtnError::new(format!(
            "Bad custody/priority in class-of-service token {:?}",
            token
        )));
    }

    let mut cos = ClassOfService {
        priority: priority as u8,
        custody: if custody_requested == 1 {
            CustodySwitch::SourceCustodyRequired
        } else {
            CustodySwitch::NoCustodyRequested
        },
        ecos: ExtendedCos::default(),
    };

    if count >= 3 {
        // 255 is reserved but tolerated here; bp_send demotes it to 254.
        if values[2] > 255 {
            return Err(DtnError::new(format!(
                "Ordinal out of range in class-of-service token {:?}",
                token
            )));
        }
        cos.ecos.ordinal = values[2] as u8;
    }

    if count >= 5 {
        let unreliable = values[3];
        let critical = values[4];
        if unreliable > 1 || critical > 1 {
            return Err(DtnError::new(format!(
                "Bad unreliable/critical in class-of-service token {:?}",
                token
            )));
        }
        cos.ecos.flags |= if unreliable == 1 { ECOS_BEST_EFFORT } else { 0 };
        cos.ecos.flags |= if critical == 1 { ECOS_MINIMUM_LATENCY } else { 0 };
    }

    if count == 6 {
        cos.ecos.flags |= ECOS_FLOW_LABEL_PRESENT;
        cos.ecos.flow_label = values[5];
    }

    Ok(cos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_tokens() {
        let cos = parse_class_of_service("1.2.3").unwrap();
        assert_eq!(cos.custody, CustodySwitch::SourceCustodyRequired);
        assert_eq!(cos.priority, 2);
        assert_eq!(cos.ecos.ordinal, 3);

        let cos = parse_class_of_service("0.1").unwrap();
        assert_eq!(cos.custody, CustodySwitch::NoCustodyRequested);
        assert_eq!(cos.priority, 1);
        assert_eq!(cos.ecos.ordinal, 0);
    }

    #[test]
    fn test_priority_bound() {
        assert!(parse_class_of_service("0.3.0").is_err());
    }

    #[test]
    fn test_field_counts() {
        assert!(parse_class_of_service("1").is_err());
        assert!(parse_class_of_service("1.1.1.1").is_err());
        assert!(parse_class_of_service("1.1.1.1.1.1.1").is_err());
    }

    #[test]
    fn test_critical_flag() {
        let cos = parse_class_of_service("1.1.254.0.1").unwrap();
        assert!(cos.ecos.minimum_latency());
        assert!(!cos.ecos.best_effort());
        assert_eq!(cos.ecos.flags & ECOS_FLOW_LABEL_PRESENT, 0);
    }

    #[test]
    fn test_flow_label() {
        let cos = parse_class_of_service("0.0.0.1.0.42").unwrap();
        assert!(cos.ecos.best_effort());
        assert_eq!(cos.ecos.flags & ECOS_FLOW_LABEL_PRESENT, ECOS_FLOW_LABEL_PRESENT);
        assert_eq!(cos.ecos.flow_label, 42);
    }

    #[test]
    fn test_reserved_ordinal_tolerated_at_parse() {
        let cos = parse_class_of_service("1.1.255").unwrap();
        assert_eq!(cos.ecos.ordinal, 255);
    }

    #[test]
    fn test_bounds() {
        assert!(parse_class_of_service("2.1").is_err());
        assert!(parse_class_of_service("1.1.0.2.0").is_err());
        assert!(parse_class_of_service("1.1.0.0.2").is_err());
        assert!(parse_class_of_service("a.b").is_err());
    }
}
