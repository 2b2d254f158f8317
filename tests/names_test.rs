use juju_upgrader::export::names::{
    container_names, lxc_id_to_lxd_machine_id, lxc_id_to_lxd_machine_tag, lxc_to_lxd_instance,
    namespace_hostname, rename_sequence, upgrade_tag, user_name,
};
use std::collections::HashSet;

const UUID: &str = "d7f3b9ab-1234-5678-9abc-def012345678";

#[test]
fn test_lxc_instance_rename() {
    let renamed = lxc_to_lxd_instance(UUID, "juju-machine-5-lxc-2").unwrap();
    assert_eq!(renamed, "juju-345678-5-lxd-2");

    let tag = lxc_id_to_lxd_machine_tag("5/lxc/2");
    assert_eq!(tag.id(), "5/lxd/2");
    assert_eq!(tag.to_string(), "machine-5-lxd-2");
}

#[test]
fn test_non_container_instance_unchanged() {
    assert_eq!(lxc_to_lxd_instance(UUID, "i-0abc123").unwrap(), "i-0abc123");
    assert_eq!(
        lxc_to_lxd_instance(UUID, "/MAAS/api/1.0/nodes/node-1/").unwrap(),
        "/MAAS/api/1.0/nodes/node-1/"
    );
}

#[test]
fn test_namespace_hostname_validation() {
    assert_eq!(namespace_hostname(UUID, "0").unwrap(), "juju-345678-0");
    assert!(namespace_hostname("not-a-uuid", "0").is_err());
    assert!(namespace_hostname(UUID, "01").is_err());
    assert!(namespace_hostname(UUID, "0/lxc").is_err());
}

#[test]
fn test_namespace_hostname_uuid_forms() {
    let braced = format!("{{{}}}", UUID);
    let urn = format!("urn:uuid:{}", UUID);
    assert_eq!(namespace_hostname(&braced, "0").unwrap(), "juju-345678-0");
    assert_eq!(namespace_hostname(&urn, "0/lxc/1").unwrap(), "juju-345678-0-lxc-1");
    assert_eq!(namespace_hostname(&UUID.replace('-', ""), "2").unwrap(), "juju-345678-2");
}

#[test]
fn test_machine_id_rewrite_first_level_only() {
    assert_eq!(lxc_id_to_lxd_machine_id("0/lxc/1"), "0/lxd/1");
    assert_eq!(lxc_id_to_lxd_machine_id("0/kvm/1"), "0/kvm/1");
    assert_eq!(lxc_id_to_lxd_machine_id("3"), "3");
    assert_eq!(lxc_id_to_lxd_machine_id("0/kvm/1/lxc/0"), "0/kvm/1/lxc/0");
}

#[test]
fn test_container_names_pure_and_injective() {
    let ids = ["0/lxc/0", "0/lxc/1", "1/lxc/0", "10/lxc/1", "1/lxc/10"];

    let mut seen = HashSet::new();
    for id in ids {
        let instance = format!("juju-machine-{}", id.replace('/', "-"));
        let first = container_names(UUID, id, &instance).unwrap();
        let second = container_names(UUID, id, &instance).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.0, instance);
        assert!(seen.insert(first.1.clone()), "duplicate new name {}", first.1);
    }
    assert!(seen.contains("juju-345678-10-lxd-1"));
    assert!(seen.contains("juju-345678-1-lxd-10"));
}

#[test]
fn test_sequence_renaming() {
    assert_eq!(rename_sequence("machine0lxcContainer"), "machine0lxdContainer");
    assert_eq!(rename_sequence("machine12lxcContainer"), "machine12lxdContainer");
    assert_eq!(rename_sequence("service-mysql"), "application-mysql");
    assert_eq!(rename_sequence("service-my-app2"), "application-my-app2");

    for verbatim in ["machine", "machine0kvmContainer", "charmrev-cs:trusty/mysql", "xmachine0lxcContainer"] {
        assert_eq!(rename_sequence(verbatim), verbatim);
    }
}

#[test]
fn test_user_name() {
    assert_eq!(user_name("admin@local"), "admin");
    assert_eq!(user_name("bob@external"), "bob@external");
    assert_eq!(user_name("admin"), "admin");
}

#[test]
fn test_upgrade_tag() {
    assert_eq!(upgrade_tag("service-wordpress"), "application-wordpress");
    assert_eq!(upgrade_tag("machine-0-lxc-3"), "machine-0-lxd-3");
    assert_eq!(upgrade_tag("machine-4"), "machine-4");
    assert_eq!(upgrade_tag("unit-wordpress-0"), "unit-wordpress-0");
}
