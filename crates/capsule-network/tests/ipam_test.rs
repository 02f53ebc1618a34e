//! Allocation behaviour across separate allocator handles sharing a file.

use std::net::Ipv4Addr;
use std::sync::Arc;

use capsule_network::Ipam;
use ipnetwork::Ipv4Network;

#[test]
fn handles_sharing_a_file_never_hand_out_the_same_address() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = Arc::new(dir.path().join("ipam/subnet.json"));
    let subnet: Ipv4Network = "172.30.0.0/24".parse().expect("cidr");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = Arc::clone(&path);
            std::thread::spawn(move || {
                let ipam = Ipam::new(path.as_path());
                (0..10)
                    .map(|_| ipam.allocate(&subnet).expect("allocate"))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all: Vec<Ipv4Addr> = handles
        .into_iter()
        .flat_map(|h| h.join().expect("join"))
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 40);
    assert_eq!(all[0], Ipv4Addr::new(172, 30, 0, 1));
    assert_eq!(all[39], Ipv4Addr::new(172, 30, 0, 40));
}

#[test]
fn released_address_is_reused_by_a_fresh_handle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("subnet.json");
    let subnet: Ipv4Network = "192.168.50.0/28".parse().expect("cidr");

    let first = Ipam::new(&path);
    let a = first.allocate(&subnet).expect("allocate");
    let b = first.allocate(&subnet).expect("allocate");
    first.release(&subnet, a).expect("release");

    let second = Ipam::new(&path);
    assert_eq!(second.allocate(&subnet).expect("allocate"), a);
    assert_eq!(second.allocated(&subnet).expect("list"), vec![a, b]);
}
