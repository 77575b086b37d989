use kube::CustomResourceExt;
use mimir_rules_controller_apis::MimirRule;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&MimirRule::crd()).unwrap());
}
