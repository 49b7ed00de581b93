use std::net::SocketAddr;
use std::time::Duration;

use netweft_controller::controller::{
    CircuitTestReport, Controller, ControllerOptsBuilder, RequestMeta, ResultCode,
};
use netweft_controller::identity::{DeviceAddr, NodeIdentity};
use netweft_controller::store::records::{AddressFamily, IpAssignment, IpAssignmentKind, NetworkId};

const NWID: NetworkId = NetworkId(100);

fn controller_id() -> NodeIdentity {
    NodeIdentity::new(DeviceAddr::new(0xc0ffee).unwrap(), "controller-key")
}

fn device(addr: u64) -> NodeIdentity {
    NodeIdentity::new(
        DeviceAddr::new(addr).unwrap(),
        format!("device-key-{addr:x}"),
    )
}

fn src() -> SocketAddr {
    "198.51.100.7:9993".parse().unwrap()
}

fn v4_meta() -> RequestMeta {
    RequestMeta {
        protocol_version: Some("1.0.6".to_string()),
        address_families: vec![AddressFamily::V4],
    }
}

async fn open_controller(dir: &tempfile::TempDir) -> Controller {
    let opts = ControllerOptsBuilder::default()
        .identity(controller_id())
        .db_path(dir.path().join("controller.db"))
        .build()
        .unwrap();
    Controller::open(opts).await.unwrap()
}

fn create_network(controller: &Controller, open_enrollment: bool) {
    controller
        .store()
        .write(|tx| tx.create_network(NWID, "lab", true, open_enrollment, 0))
        .unwrap();
}

fn authorize(controller: &Controller, node: DeviceAddr) {
    controller
        .store()
        .write(|tx| {
            if tx.member(NWID, node)?.is_none() {
                tx.create_member(NWID, node, false, 0)?;
            }
            tx.set_member_authorized(NWID, node, true)
        })
        .unwrap();
}

#[tokio::test]
async fn test_open_enrollment_first_contact_is_pending() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open_controller(&dir).await;
    create_network(&controller, true);

    let requester = device(0x0a);
    let response = controller.request_config(src(), &controller_id(), &requester, NWID, &v4_meta());

    assert_eq!(response.code, ResultCode::Pending);
    assert!(response.config.is_none());

    // intent to join was recorded, unauthorized
    let member = controller
        .store()
        .read(|tx| tx.member(NWID, requester.address))
        .unwrap()
        .unwrap();
    assert!(!member.authorized);

    let snapshot = controller
        .request_log()
        .snapshot(requester.address, NWID)
        .unwrap();
    assert_eq!(snapshot.total_requests, 1);
    assert!(!snapshot.outcomes[0].authorized);
}

#[tokio::test]
async fn test_closed_network_records_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open_controller(&dir).await;
    create_network(&controller, false);

    let requester = device(0x0a);
    let response = controller.request_config(src(), &controller_id(), &requester, NWID, &v4_meta());

    assert_eq!(response.code, ResultCode::Disabled);
    assert!(
        controller
            .store()
            .read(|tx| tx.member(NWID, requester.address))
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_unknown_network_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open_controller(&dir).await;

    let response =
        controller.request_config(src(), &controller_id(), &device(0x0a), NWID, &v4_meta());
    assert_eq!(response.code, ResultCode::NotFound);
}

#[tokio::test]
async fn test_authorized_member_gets_pool_address() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open_controller(&dir).await;
    create_network(&controller, true);
    controller
        .store()
        .write(|tx| tx.add_pool(NWID, "10.0.0.0/24".parse().unwrap()))
        .unwrap();

    let requester = device(0x0a);
    authorize(&controller, requester.address);

    let response = controller.request_config(src(), &controller_id(), &requester, NWID, &v4_meta());
    assert_eq!(response.code, ResultCode::Ok);

    let config = response.config.unwrap();
    let pool: ipnet::Ipv4Net = "10.0.0.0/24".parse().unwrap();
    let addresses: Vec<_> = config
        .assignments
        .iter()
        .filter(|a| a.kind == IpAssignmentKind::Address)
        .collect();
    assert_eq!(addresses.len(), 1);
    match addresses[0].net.addr() {
        std::net::IpAddr::V4(v4) => assert!(pool.contains(&v4)),
        other => panic!("expected IPv4 address, got {other}"),
    }

    // revision stamp equals the network's current revision
    let network = controller
        .store()
        .read(|tx| tx.network(NWID))
        .unwrap()
        .unwrap();
    assert_eq!(config.revision, network.revision);
    assert!(config.exhausted_families.is_empty());
}

#[tokio::test]
async fn test_repeat_request_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open_controller(&dir).await;
    create_network(&controller, true);
    controller
        .store()
        .write(|tx| tx.add_pool(NWID, "10.0.0.0/24".parse().unwrap()))
        .unwrap();

    let requester = device(0x0a);
    authorize(&controller, requester.address);

    let revision_before = controller
        .store()
        .read(|tx| tx.network_revision(NWID))
        .unwrap();

    let first = controller.request_config(src(), &controller_id(), &requester, NWID, &v4_meta());
    let second = controller.request_config(src(), &controller_id(), &requester, NWID, &v4_meta());

    assert_eq!(first.code, ResultCode::Ok);
    assert_eq!(second.code, ResultCode::Ok);

    let first_config = first.config.unwrap();
    let mut second_config = second.config.unwrap();
    second_config.timestamp = first_config.timestamp;
    assert_eq!(first_config, second_config);

    // no revision advanced by re-issuing an unchanged request
    let revision_after = controller
        .store()
        .read(|tx| tx.network_revision(NWID))
        .unwrap();
    assert_eq!(revision_before, revision_after);
}

#[tokio::test]
async fn test_pool_exhaustion_is_partial_success() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open_controller(&dir).await;
    create_network(&controller, true);
    controller
        .store()
        .write(|tx| {
            // /30 leaves exactly two usable hosts
            tx.add_pool(NWID, "10.0.0.0/30".parse().unwrap())?;
            for (node, ip) in [(0x0b_u64, "10.0.0.1/30"), (0x0c, "10.0.0.2/30")] {
                tx.insert_ip_assignment(&IpAssignment {
                    network_id: NWID,
                    node: DeviceAddr::new(node).unwrap(),
                    net: ip.parse().unwrap(),
                    kind: IpAssignmentKind::Address,
                })?;
            }
            Ok(())
        })
        .unwrap();

    let requester = device(0x0a);
    authorize(&controller, requester.address);

    let response = controller.request_config(src(), &controller_id(), &requester, NWID, &v4_meta());
    assert_eq!(response.code, ResultCode::Ok);

    let config = response.config.unwrap();
    assert_eq!(config.exhausted_families, vec![AddressFamily::V4]);
    assert!(
        config
            .assignments
            .iter()
            .all(|a| a.kind != IpAssignmentKind::Address)
    );
}

#[tokio::test]
async fn test_no_two_members_share_an_address() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open_controller(&dir).await;
    create_network(&controller, true);
    controller
        .store()
        .write(|tx| tx.add_pool(NWID, "10.0.0.0/28".parse().unwrap()))
        .unwrap();

    let mut seen = std::collections::HashSet::new();
    for node in [0x0a_u64, 0x0b, 0x0c, 0x0d] {
        let requester = device(node);
        authorize(&controller, requester.address);
        let response =
            controller.request_config(src(), &controller_id(), &requester, NWID, &v4_meta());
        let config = response.config.unwrap();
        let address = config
            .assignments
            .iter()
            .find(|a| a.kind == IpAssignmentKind::Address)
            .unwrap()
            .net
            .addr();
        assert!(seen.insert(address), "address {address} allocated twice");
    }
}

#[tokio::test]
async fn test_revocation_denies_without_stale_config() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open_controller(&dir).await;
    create_network(&controller, true);
    controller
        .store()
        .write(|tx| tx.add_pool(NWID, "10.0.0.0/24".parse().unwrap()))
        .unwrap();

    let requester = device(0x0a);
    authorize(&controller, requester.address);

    let first = controller.request_config(src(), &controller_id(), &requester, NWID, &v4_meta());
    assert_eq!(first.code, ResultCode::Ok);

    controller
        .store()
        .write(|tx| tx.set_member_authorized(NWID, requester.address, false))
        .unwrap();

    let second = controller.request_config(src(), &controller_id(), &requester, NWID, &v4_meta());
    assert_eq!(second.code, ResultCode::Disabled);
    assert!(second.config.is_none());
}

#[tokio::test]
async fn test_revoked_before_first_config_is_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open_controller(&dir).await;
    create_network(&controller, true);

    let requester = device(0x0a);
    authorize(&controller, requester.address);
    // revoked before any config was ever issued
    controller
        .store()
        .write(|tx| tx.set_member_authorized(NWID, requester.address, false))
        .unwrap();

    let response = controller.request_config(src(), &controller_id(), &requester, NWID, &v4_meta());
    assert_eq!(response.code, ResultCode::Disabled);
    assert!(response.config.is_none());
}

#[tokio::test]
async fn test_concurrent_network_deletion_leaves_no_orphans() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open_controller(&dir).await;

    for round in 0..25u64 {
        create_network(&controller, true);
        controller
            .store()
            .write(|tx| tx.add_pool(NWID, "10.0.0.0/24".parse().unwrap()))
            .unwrap();
        let requester = device(0x100 + round);
        authorize(&controller, requester.address);

        std::thread::scope(|s| {
            s.spawn(|| {
                controller.request_config(src(), &controller_id(), &requester, NWID, &v4_meta());
            });
            s.spawn(|| {
                controller
                    .store()
                    .write(|tx| tx.delete_network(NWID))
                    .unwrap();
            });
        });

        // whatever the interleaving, nothing may outlive the network
        controller
            .store()
            .read(|tx| {
                assert!(tx.network(NWID)?.is_none());
                assert!(tx.member(NWID, requester.address)?.is_none());
                assert!(tx.allocated_addresses(NWID, AddressFamily::V4)?.is_empty());
                Ok(())
            })
            .unwrap();
    }
}

#[tokio::test]
async fn test_deleted_member_address_is_reusable() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open_controller(&dir).await;
    create_network(&controller, true);
    controller
        .store()
        .write(|tx| {
            // a single usable host
            tx.add_pool(NWID, "10.0.0.0/30".parse().unwrap())?;
            tx.insert_ip_assignment(&IpAssignment {
                network_id: NWID,
                node: DeviceAddr::new(0x0b).unwrap(),
                net: "10.0.0.2/30".parse().unwrap(),
                kind: IpAssignmentKind::Address,
            })
        })
        .unwrap();

    let first = device(0x0a);
    authorize(&controller, first.address);
    let response = controller.request_config(src(), &controller_id(), &first, NWID, &v4_meta());
    let first_address = response
        .config
        .unwrap()
        .assignments
        .iter()
        .find(|a| a.kind == IpAssignmentKind::Address)
        .unwrap()
        .net
        .addr();

    controller
        .store()
        .write(|tx| tx.delete_member(NWID, first.address))
        .unwrap();

    let second = device(0x0d);
    authorize(&controller, second.address);
    let response = controller.request_config(src(), &controller_id(), &second, NWID, &v4_meta());
    let second_address = response
        .config
        .unwrap()
        .assignments
        .iter()
        .find(|a| a.kind == IpAssignmentKind::Address)
        .unwrap()
        .net
        .addr();

    // the released address is the only one available again
    assert_eq!(first_address, second_address);
}

#[tokio::test]
async fn test_identity_collision_is_auth_failure() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open_controller(&dir).await;
    create_network(&controller, true);

    let original = device(0x0a);
    authorize(&controller, original.address);
    let response = controller.request_config(src(), &controller_id(), &original, NWID, &v4_meta());
    assert_eq!(response.code, ResultCode::Ok);

    // same address, different key
    let imposter = NodeIdentity::new(original.address, "some-other-key");
    let response = controller.request_config(src(), &controller_id(), &imposter, NWID, &v4_meta());
    assert_eq!(response.code, ResultCode::AuthFailure);
    assert!(response.config.is_none());

    // the original binding still works
    let response = controller.request_config(src(), &controller_id(), &original, NWID, &v4_meta());
    assert_eq!(response.code, ResultCode::Ok);
}

#[tokio::test]
async fn test_foreign_signing_identity_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open_controller(&dir).await;
    create_network(&controller, true);

    let foreign_signer = NodeIdentity::new(DeviceAddr::new(0xdead).unwrap(), "foreign-key");
    let response =
        controller.request_config(src(), &foreign_signer, &device(0x0a), NWID, &v4_meta());
    assert_eq!(response.code, ResultCode::InternalError);
}

#[tokio::test]
async fn test_circuit_tests_expire_without_reports() {
    let dir = tempfile::tempdir().unwrap();
    let opts = ControllerOptsBuilder::default()
        .identity(controller_id())
        .db_path(dir.path().join("controller.db"))
        .circuit_test_timeout(50)
        .housekeeping_interval(25)
        .build()
        .unwrap();
    let controller = Controller::open(opts).await.unwrap();

    controller.start_circuit_test(0x1234, vec![0xde, 0xad]).unwrap();
    assert!(controller.circuit_tests().contains(0x1234));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(controller.circuit_tests().outstanding(), 0);

    // a report arriving after expiry is silently dropped
    controller.record_circuit_test_report(
        0x1234,
        &CircuitTestReport {
            reporter: DeviceAddr::new(0x0b).unwrap(),
            timestamp: 0,
            payload: vec![],
        },
    );
    assert_eq!(controller.circuit_tests().outstanding(), 0);
}
