//! License pool records.
//!
//! A license file's content hash is its stable identity across blob storage,
//! the stock table and the usage table. At most one usage record exists per
//! VM at any instant.

use serde::{Deserialize, Serialize};

/// A license file present in blob storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseFile {
    /// File name within the license directory
    pub file_name: String,
    /// Content hash; unique across the pool
    pub checksum: String,
    /// Hash algorithm that produced `checksum`
    pub algorithm: String,
    /// Storage key the content can be fetched from
    pub blob_key: String,
    /// File content, fetched lazily
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Stock table entry: one license known to the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseStockRecord {
    /// Content hash (table key)
    pub checksum: String,
    pub file_name: String,
    pub algorithm: String,
    pub product_name: String,
}

impl LicenseStockRecord {
    /// Builds the stock entry for a discovered license file
    pub fn from_file(file: &LicenseFile, product_name: impl Into<String>) -> Self {
        Self {
            checksum: file.checksum.clone(),
            file_name: file.file_name.clone(),
            algorithm: file.algorithm.clone(),
            product_name: product_name.into(),
        }
    }
}

/// Usage table entry: one license assigned to one VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseUsageRecord {
    /// Holder VM id (table key)
    pub vm_id: String,
    /// Checksum of the assigned license; must reference a stock entry
    pub checksum: String,
    pub file_name: String,
    pub product_name: String,
    /// Holder's membership state cached from the last reconciliation
    pub vm_in_sync: bool,
    /// Absolute ms timestamp of the assignment
    pub assigned_at: u64,
}

/// The outcome handed back to a VM requesting a license
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedLicense {
    pub checksum: String,
    pub file_name: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_from_file() {
        let file = LicenseFile {
            file_name: "fgt-1.lic".to_string(),
            checksum: "abc123".to_string(),
            algorithm: "sha256".to_string(),
            blob_key: "licenses/fgt-1.lic".to_string(),
            content: None,
        };
        let stock = LicenseStockRecord::from_file(&file, "fortigate");
        assert_eq!(stock.checksum, "abc123");
        assert_eq!(stock.product_name, "fortigate");
    }
}
