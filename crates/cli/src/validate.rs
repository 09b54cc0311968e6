//! Identifier shape validation for CLI and config input

use std::sync::OnceLock;

use anyhow::{bail, Result};
use regex::Regex;

use ptp_lib::InstanceTypeSpec;

fn instance_type_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z][0-9][a-z]*\.(nano|micro|small|medium|large|xlarge|[0-9]+xlarge|metal)$")
            .expect("valid instance type pattern")
    })
}

fn id_pattern(prefix: &'static str) -> Regex {
    Regex::new(&format!(r"^{prefix}-[0-9a-f]{{8,17}}$")).expect("valid id pattern")
}

fn subnet_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| id_pattern("subnet"))
}

fn ami_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| id_pattern("ami"))
}

fn security_group_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| id_pattern("sg"))
}

fn region_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z]{2}-[a-z]+-[0-9]$").expect("valid region pattern"))
}

/// Parse one `type` or `type:quantity` spec.
pub fn parse_spec(input: &str) -> Result<InstanceTypeSpec> {
    let input = input.trim();
    let (instance_type, quantity) = match input.split_once(':') {
        Some((instance_type, quantity)) => {
            let quantity: u32 = quantity
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid quantity in '{input}'"))?;
            (instance_type.trim(), quantity)
        }
        None => (input, 1),
    };

    if quantity < 1 {
        bail!("quantity must be positive in '{input}'");
    }
    if !instance_type_pattern().is_match(instance_type) {
        bail!(
            "invalid instance type '{instance_type}' (expected family.size, e.g. c7i.large)"
        );
    }
    Ok(InstanceTypeSpec::new(instance_type, quantity))
}

/// Parse a comma-separated list of instance type specs.
pub fn parse_spec_list(input: &str) -> Result<Vec<InstanceTypeSpec>> {
    let specs: Vec<InstanceTypeSpec> = input
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(parse_spec)
        .collect::<Result<_>>()?;
    if specs.is_empty() {
        bail!("at least one instance type must be provided");
    }
    Ok(specs)
}

pub fn validate_subnet_id(value: &str) -> Result<()> {
    if subnet_pattern().is_match(value) {
        Ok(())
    } else {
        bail!("invalid subnet id '{value}' (expected subnet-[0-9a-f]{{8,17}})")
    }
}

pub fn validate_ami_id(value: &str) -> Result<()> {
    if ami_pattern().is_match(value) {
        Ok(())
    } else {
        bail!("invalid AMI id '{value}' (expected ami-[0-9a-f]{{8,17}})")
    }
}

pub fn validate_security_group_id(value: &str) -> Result<()> {
    if security_group_pattern().is_match(value) {
        Ok(())
    } else {
        bail!("invalid security group id '{value}' (expected sg-[0-9a-f]{{8,17}})")
    }
}

pub fn validate_region(value: &str) -> Result<()> {
    if region_pattern().is_match(value) {
        Ok(())
    } else {
        bail!("invalid region '{value}' (expected e.g. us-east-1)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spec_plain_and_quantity() {
        assert_eq!(
            parse_spec("c7i.large").unwrap(),
            InstanceTypeSpec::new("c7i.large", 1)
        );
        assert_eq!(
            parse_spec("m7i.xlarge:3").unwrap(),
            InstanceTypeSpec::new("m7i.xlarge", 3)
        );
        assert_eq!(
            parse_spec("r6i.2xlarge:2").unwrap(),
            InstanceTypeSpec::new("r6i.2xlarge", 2)
        );
    }

    #[test]
    fn test_parse_spec_rejects_bad_input() {
        assert!(parse_spec("c7i.large:0").is_err());
        assert!(parse_spec("c7i.large:x").is_err());
        assert!(parse_spec("notatype").is_err());
        assert!(parse_spec("C7I.LARGE").is_err());
        assert!(parse_spec("c7i.large:1:2").is_err());
    }

    #[test]
    fn test_parse_spec_list() {
        let specs = parse_spec_list("c7gn.large:2, c7i.large").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].quantity, 2);
        assert_eq!(specs[1].instance_type, "c7i.large");

        assert!(parse_spec_list("").is_err());
        assert!(parse_spec_list(" , ").is_err());
    }

    #[test]
    fn test_identifier_shapes() {
        assert!(validate_subnet_id("subnet-12345678").is_ok());
        assert!(validate_subnet_id("subnet-1234567890abcdef0").is_ok());
        assert!(validate_subnet_id("subnet-xyz").is_err());
        assert!(validate_subnet_id("sg-12345678").is_err());

        assert!(validate_ami_id("ami-0abcdef12").is_ok());
        assert!(validate_ami_id("ami-").is_err());

        assert!(validate_security_group_id("sg-12345678").is_ok());

        assert!(validate_region("us-east-1").is_ok());
        assert!(validate_region("eu-west-2").is_ok());
        assert!(validate_region("useast1").is_err());
    }
}
