use std::collections::HashMap;

use serde_derive::Deserialize;

use crate::error::{Error, Result};

/// One argument of a UPnP action, with the data type of its related state
/// variable ("string", "ui4", ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionArgument {
    pub name: String,
    pub data_type: String,
}

/// A callable action discovered from a service's SCPD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDescriptor {
    pub name: String,
    pub in_args: Vec<ActionArgument>,
    pub out_args: Vec<ActionArgument>,
}

#[derive(Debug, Deserialize)]
struct Scpd {
    #[serde(rename = "actionList", default)]
    action_list: ActionList,
    #[serde(rename = "serviceStateTable", default)]
    state_table: StateTable,
}

#[derive(Debug, Deserialize, Default)]
struct ActionList {
    #[serde(rename = "action", default)]
    actions: Vec<ScpdAction>,
}

#[derive(Debug, Deserialize)]
struct ScpdAction {
    name: String,
    #[serde(rename = "argumentList", default)]
    argument_list: ArgumentList,
}

#[derive(Debug, Deserialize, Default)]
struct ArgumentList {
    #[serde(rename = "argument", default)]
    arguments: Vec<ScpdArgument>,
}

#[derive(Debug, Deserialize)]
struct ScpdArgument {
    name: String,
    #[serde(default)]
    direction: String,
    #[serde(rename = "relatedStateVariable", default)]
    related_state_variable: String,
}

#[derive(Debug, Deserialize, Default)]
struct StateTable {
    #[serde(rename = "stateVariable", default)]
    variables: Vec<StateVariable>,
}

#[derive(Debug, Deserialize)]
struct StateVariable {
    name: String,
    #[serde(rename = "dataType", default)]
    data_type: String,
}

pub(crate) fn parse_scpd(xml: &str) -> Result<HashMap<String, ActionDescriptor>> {
    let scpd: Scpd = quick_xml::de::from_str(xml).map_err(Error::protocol)?;
    let data_types: HashMap<&str, &str> = scpd
        .state_table
        .variables
        .iter()
        .map(|v| (v.name.as_str(), v.data_type.as_str()))
        .collect();

    let mut actions = HashMap::new();
    for action in scpd.action_list.actions {
        let mut in_args = Vec::new();
        let mut out_args = Vec::new();
        for arg in action.argument_list.arguments {
            let data_type = data_types
                .get(arg.related_state_variable.as_str())
                .copied()
                .unwrap_or("string")
                .to_owned();
            let parsed = ActionArgument {
                name: arg.name,
                data_type,
            };
            if arg.direction.eq_ignore_ascii_case("out") {
                out_args.push(parsed);
            } else {
                in_args.push(parsed);
            }
        }
        actions.insert(
            action.name.clone(),
            ActionDescriptor {
                name: action.name,
                in_args,
                out_args,
            },
        );
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::parse_scpd;

    #[test]
    fn test_parse_scpd() {
        let actions = parse_scpd(include_str!("resources/test/service_scpd.xml")).unwrap();
        let action = actions.get("GetCurrentTransportActions").unwrap();
        assert_eq!(action.in_args.len(), 1);
        assert_eq!(action.in_args[0].name, "InstanceID");
        assert_eq!(action.in_args[0].data_type, "ui4");
        assert_eq!(action.out_args.len(), 1);
        assert_eq!(action.out_args[0].name, "Actions");
        assert_eq!(action.out_args[0].data_type, "string");

        let seek = actions.get("Seek").unwrap();
        let names: Vec<&str> = seek.in_args.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["InstanceID", "Unit", "Target"]);
    }

    #[test]
    fn test_parse_scpd_without_actions() {
        let xml = r#"<?xml version="1.0"?>
            <scpd xmlns="urn:schemas-upnp-org:service-1-0">
              <specVersion><major>1</major><minor>0</minor></specVersion>
            </scpd>"#;
        assert!(parse_scpd(xml).unwrap().is_empty());
    }
}
