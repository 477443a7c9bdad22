use serde::{Deserialize, Serialize};

/// Inventory attributes endpoint, relative to a server URL.
pub const INVENTORY_ATTRIBUTES_PATH: &str = "/api/devices/v1/inventory/device/attributes";

/// One inventory attribute. Scalar values upload as a plain string, repeated
/// keys as a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAttribute {
    pub name: String,
    pub value: AttributeValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Single(String),
    List(Vec<String>),
}

impl From<Vec<String>> for AttributeValue {
    fn from(mut values: Vec<String>) -> Self {
        if values.len() == 1 {
            AttributeValue::Single(values.remove(0))
        } else {
            AttributeValue::List(values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_value_collapses() {
        let attribute = InventoryAttribute {
            name: "device_type".to_string(),
            value: vec!["rspi".to_string()].into(),
        };
        let json = serde_json::to_string(&attribute).unwrap();
        assert_eq!(json, r#"{"name":"device_type","value":"rspi"}"#);
    }

    #[test]
    fn test_repeated_values_stay_a_list() {
        let attribute = InventoryAttribute {
            name: "mac".to_string(),
            value: vec!["aa".to_string(), "bb".to_string()].into(),
        };
        let json = serde_json::to_string(&attribute).unwrap();
        assert_eq!(json, r#"{"name":"mac","value":["aa","bb"]}"#);
    }
}
