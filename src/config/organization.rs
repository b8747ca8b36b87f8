use config::builder::BuilderState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};

use super::ConfigDefaults;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrganizationType {
    Practice,
    Hospital,
    Clinic,
    Pharmacy,
    Lab,
    Imaging,
    Other,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrganizationConfig {
    pub npi: String,
    pub name: String,
    #[serde(rename = "type")]
    pub org_type: OrganizationType,
}

impl ConfigDefaults for OrganizationConfig {
    fn set_defaults<T: BuilderState>(builder: ConfigBuilder<T>, prefix: &str) -> ConfigBuilder<T> {
        builder
            .set_default(format!("{prefix}.npi"), "")
            .unwrap()
            .set_default(format!("{prefix}.name"), "")
            .unwrap()
            .set_default(format!("{prefix}.type"), "practice")
            .unwrap()
    }
}

impl OrganizationConfig {
    /// Checked separately from loading so a config file can be parsed
    /// (and inspected, e.g. by tests) before its NPI is known to be real.
    pub fn validate(&self) -> Result<(), String> {
        if !crate::npi::is_valid(&self.npi) {
            return Err(format!("organization.npi '{}' is not a Luhn-valid 10-digit NPI", self.npi));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(npi: &str) -> OrganizationConfig {
        OrganizationConfig { npi: npi.into(), name: "Test Clinic".into(), org_type: OrganizationType::Clinic }
    }

    #[test]
    fn accepts_a_valid_npi() {
        assert!(config("1234567897").validate().is_ok());
    }

    #[test]
    fn rejects_an_invalid_npi() {
        assert!(config("1234567893").validate().is_err());
        assert!(config("0000000000").validate().is_err());
        assert!(config("").validate().is_err());
    }
}
