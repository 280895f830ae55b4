use std::{cell::RefCell, rc::Rc, thread, time::Duration};

use atbus::{BusId, Error, Node, NodeConf};

fn conf(children_mask: u32, father: &str) -> NodeConf {
    NodeConf {
        children_mask,
        father_address: father.to_owned(),
        ..NodeConf::default()
    }
}

fn capture_errors(node: &mut Node) -> Rc<RefCell<Vec<Error>>> {
    let errors: Rc<RefCell<Vec<Error>>> = Rc::default();
    let sink = errors.clone();
    node.set_on_error(move |err| sink.borrow_mut().push(err));
    errors
}

#[test]
fn colliding_bus_id_is_rejected() {
    let id: BusId = 0x1234_5678;

    let mut a = Node::new(id, conf(16, "")).unwrap();
    a.listen("ipv4://127.0.0.1:16447").unwrap();
    // same id, pretending to be a different process on the bus
    let mut imposter = Node::new(id, conf(16, "")).unwrap();
    let errors = capture_errors(&mut imposter);

    imposter.connect("ipv4://127.0.0.1:16447").unwrap();

    let mut t = 0i64;
    for _ in 0..100 {
        t += 1;
        a.proc(t, 0).unwrap();
        imposter.proc(t, 0).unwrap();
        if !errors.borrow().is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    assert!(errors.borrow().contains(&Error::InvalidId));
    assert!(a.endpoint(id).is_none());
    assert!(imposter.endpoint(id).is_none());
}

#[test]
fn overlapping_subtree_is_rejected() {
    let p_id: BusId = 0x1234_5678;
    let c1_id: BusId = 0x1234_6789;
    // same /8 range as c1, different identifier
    let clash_id: BusId = 0x1234_67aa;

    let mut p = Node::new(p_id, conf(16, "")).unwrap();
    p.listen("ipv4://127.0.0.1:16448").unwrap();
    let mut c1 = Node::new(c1_id, conf(8, "ipv4://127.0.0.1:16448")).unwrap();
    let mut clash = Node::new(clash_id, conf(8, "ipv4://127.0.0.1:16448")).unwrap();
    let errors = capture_errors(&mut clash);

    c1.start().unwrap();

    let mut t = 0i64;
    for _ in 0..100 {
        t += 1;
        p.proc(t, 0).unwrap();
        c1.proc(t, 0).unwrap();
        if p.endpoint(c1_id).is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(p.endpoint(c1_id).is_some(), "first child registers fine");

    clash.start().unwrap();
    for _ in 0..100 {
        t += 1;
        p.proc(t, 0).unwrap();
        c1.proc(t, 0).unwrap();
        clash.proc(t, 0).unwrap();
        if !errors.borrow().is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    assert!(errors.borrow().contains(&Error::InvalidId));
    assert!(p.endpoint(clash_id).is_none(), "overlapping subtree kept out");
    assert!(p.endpoint(c1_id).is_some(), "existing child untouched");
}

#[test]
fn unreachable_target_fails_with_invalid_id() {
    let mut n = Node::new(0x1234_5678, conf(16, "")).unwrap();
    assert_eq!(n.send_data(0x9999_0000, 0, b"nowhere").unwrap_err(), Error::InvalidId);
}

#[test]
fn forward_failure_notifies_the_origin() {
    let p_id: BusId = 0x1234_5678;
    let c_id: BusId = 0x1234_6789;
    // inside p's subtree but nobody is registered there
    let ghost_id: BusId = 0x1234_7001;

    let mut p = Node::new(p_id, conf(16, "")).unwrap();
    p.listen("ipv4://127.0.0.1:16449").unwrap();
    let mut c = Node::new(c_id, conf(8, "ipv4://127.0.0.1:16449")).unwrap();

    let failed: Rc<RefCell<Vec<(BusId, i32, Vec<u8>, i32)>>> = Rc::default();
    let sink = failed.clone();
    c.set_on_send_data_failed(move |to, msg_type, data, ret| {
        sink.borrow_mut().push((to, msg_type, data.to_vec(), ret));
    });

    c.start().unwrap();

    let mut t = 0i64;
    for _ in 0..100 {
        t += 1;
        p.proc(t, 0).unwrap();
        c.proc(t, 0).unwrap();
        if c.endpoint(p_id).is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    c.send_data(ghost_id, 5, b"into the void").unwrap();
    for _ in 0..100 {
        t += 1;
        p.proc(t, 0).unwrap();
        c.proc(t, 0).unwrap();
        if !failed.borrow().is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    let failed = failed.borrow();
    assert_eq!(failed.len(), 1);
    let (to, msg_type, data, ret) = &failed[0];
    assert_eq!(*to, ghost_id);
    assert_eq!(*msg_type, 5);
    assert_eq!(data, b"into the void");
    assert!(*ret < 0, "negative error code travels back, got {ret}");
}
