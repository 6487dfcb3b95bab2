use serde::{Deserialize, Serialize};

pub const SDS_TYPE_CODE_OBJECT: u16 = 1;
pub const SDS_TYPE_CODE_DOUBLE: u16 = 14;
pub const SDS_TYPE_CODE_DATE_TIME: u16 = 16;

/// Type definition registered with the metadata service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SdsType {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub sds_type_code: u16,
    #[serde(default)]
    pub properties: Vec<SdsTypeProperty>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SdsTypeProperty {
    pub id: String,
    #[serde(default)]
    pub is_key: bool,
    pub sds_type: SdsTypeRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SdsTypeRef {
    pub sds_type_code: u16,
}

impl SdsType {
    /// Type matching [`crate::readings::TemperatureReading`]: DateTime key + double
    pub fn temperature_readings(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: Some(id.to_string()),
            description: Some("Temperature readings imported from CSV".to_string()),
            sds_type_code: SDS_TYPE_CODE_OBJECT,
            properties: vec![
                SdsTypeProperty {
                    id: "Timestamp".to_string(),
                    is_key: true,
                    sds_type: SdsTypeRef {
                        sds_type_code: SDS_TYPE_CODE_DATE_TIME,
                    },
                },
                SdsTypeProperty {
                    id: "Temperature".to_string(),
                    is_key: false,
                    sds_type: SdsTypeRef {
                        sds_type_code: SDS_TYPE_CODE_DOUBLE,
                    },
                },
            ],
        }
    }
}

/// Stream bound to a type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SdsStream {
    pub id: String,
    pub type_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SdsStream {
    pub fn new(id: &str, type_id: &str) -> Self {
        Self {
            id: id.to_string(),
            type_id: type_id.to_string(),
            name: None,
            description: None,
        }
    }
}
