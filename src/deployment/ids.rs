//! Deployment ids: `tf:<instance>:` for instances, `tf:<instance>:<binding>` for bindings.

const PREFIX: &str = "tf";

pub fn instance_deployment_id(instance_id: &str) -> String {
    format!("{PREFIX}:{instance_id}:")
}

pub fn binding_deployment_id(instance_id: &str, binding_id: &str) -> String {
    format!("{PREFIX}:{instance_id}:{binding_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed() {
        assert_eq!(instance_deployment_id("abc"), "tf:abc:");
        assert_eq!(binding_deployment_id("abc", "def"), "tf:abc:def");
    }
}
