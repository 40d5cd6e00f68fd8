//! End-to-end tests: a real server and client over loopback TCP.
//!
//! Both endpoints live in this one process, so each side gets a
//! distinct instance tag; object ids then sort out ownership exactly as
//! they would across two machines.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tether_proto::{
    CallBuilder, ConnectionConfig, Delegate, Error, Event, Remotable, RemoteIface, RemotingClient,
    RemotingServer, Result, ServiceMap, pass_by_value, remotable, remote_interface,
};

remote_interface! {
    /// The callback surface a client registers with the server.
    pub trait Callback {
        fn notify(&self, msg: String) -> Result<()>;
    }
}

remote_interface! {
    /// A smaller object handed out by the main service.
    pub trait Component {
        fn name(&self) -> Result<String>;
    }
}

remote_interface! {
    /// The service the tests drive.
    pub trait Calculator {
        fn process_tag(&self) -> Result<String>;
        fn update_argument(&self, a: &mut i32) -> Result<()>;
        fn register_callback(&self, cb: Arc<dyn Callback>) -> Result<()>;
        fn do_callback(&self) -> Result<()>;
        fn add_an_event(&self, h: Delegate<String>) -> Result<()>;
        fn remove_an_event(&self, h: Delegate<String>) -> Result<()>;
        fn fire_event(&self, msg: String) -> Result<()>;
        fn describe(&self, item: Opaque) -> Result<()>;
        fn fail_with(&self, msg: String) -> Result<()>;
        fn get_component(&self) -> Result<Arc<dyn Component>>;
    }
}

/// A value the payload serializer refuses: stands in for anything that
/// is neither serializable nor remotable.
pub struct Opaque;

impl Serialize for Opaque {
    fn serialize<S: serde::Serializer>(&self, _s: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::Error as _;
        Err(S::Error::custom("holds a raw os resource"))
    }
}

impl<'de> Deserialize<'de> for Opaque {
    fn deserialize<D: serde::Deserializer<'de>>(_d: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error as _;
        Err(D::Error::custom("holds a raw os resource"))
    }
}

pass_by_value! { Opaque }

struct ComponentImpl;
impl Component for ComponentImpl {
    fn name(&self) -> Result<String> {
        Ok("component".to_owned())
    }
}
remotable! { ComponentImpl: Component }

struct CalculatorImpl {
    tag: String,
    callback: Mutex<Option<Arc<dyn Callback>>>,
    an_event: Event<String>,
    component: Mutex<Option<Arc<dyn Component>>>,
}

impl CalculatorImpl {
    fn new(tag: &str) -> Self {
        CalculatorImpl {
            tag: tag.to_owned(),
            callback: Mutex::new(None),
            an_event: Event::new(),
            component: Mutex::new(None),
        }
    }
}

impl Calculator for CalculatorImpl {
    fn process_tag(&self) -> Result<String> {
        Ok(self.tag.clone())
    }
    fn update_argument(&self, a: &mut i32) -> Result<()> {
        *a += 2;
        Ok(())
    }
    fn register_callback(&self, cb: Arc<dyn Callback>) -> Result<()> {
        *self.callback.lock().unwrap() = Some(cb);
        Ok(())
    }
    fn do_callback(&self) -> Result<()> {
        let cb = self
            .callback
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::ProxyManagement("no callback registered".into()))?;
        cb.notify("ping".to_owned())
    }
    fn add_an_event(&self, h: Delegate<String>) -> Result<()> {
        self.an_event.add(h);
        Ok(())
    }
    fn remove_an_event(&self, h: Delegate<String>) -> Result<()> {
        self.an_event.remove(&h);
        Ok(())
    }
    fn fire_event(&self, msg: String) -> Result<()> {
        self.an_event.fire(msg)
    }
    fn describe(&self, _item: Opaque) -> Result<()> {
        Ok(())
    }
    fn fail_with(&self, msg: String) -> Result<()> {
        Err(Error::Unsupported(msg))
    }
    fn get_component(&self) -> Result<Arc<dyn Component>> {
        let mut slot = self.component.lock().unwrap();
        if slot.is_none() {
            *slot = Some(Arc::new(ComponentImpl));
        }
        Ok(slot.clone().unwrap())
    }
}
remotable! { CalculatorImpl: Calculator }

struct CallbackImpl {
    hits: Mutex<Vec<String>>,
}
impl Callback for CallbackImpl {
    fn notify(&self, msg: String) -> Result<()> {
        self.hits.lock().unwrap().push(msg);
        Ok(())
    }
}
remotable! { CallbackImpl: Callback }

/// Bring up a connected server/client pair with distinct identities.
fn pair(name: &str) -> (RemotingServer, RemotingClient) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let services = ServiceMap::new();
    services.register_service(
        <dyn Calculator>::NAME,
        Arc::new(CalculatorImpl::new("service")),
    );
    services.register_factory("CalculatorImpl", |ctx| {
        let tag: Option<String> = ctx.next_arg().ok();
        Ok(Arc::new(CalculatorImpl::new(
            tag.as_deref().unwrap_or("constructed"),
        )))
    });

    let server = RemotingServer::bind(
        "127.0.0.1:0",
        ConnectionConfig::new().instance_tag(format!("{name}-srv")),
        services,
    )
    .unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let client = RemotingClient::connect(
        addr,
        ConnectionConfig::new().instance_tag(format!("{name}-cli")),
    )
    .unwrap();
    (server, client)
}

#[test]
fn basic_call_reaches_the_other_side() {
    let (server, client) = pair("basic");
    let calc = client.get_service::<dyn Calculator>().unwrap();
    assert_eq!(calc.process_tag().unwrap(), "service");
    // The proxy is tracked, and its id belongs to the server.
    let as_obj: Arc<dyn Remotable> = calc.clone();
    let id = client.instances().try_get_id(&as_obj).unwrap();
    assert!(id.is_owned_by(server.ident()));
    server.shutdown();
}

#[test]
fn by_ref_argument_comes_back_amended() {
    let (server, client) = pair("byref");
    let calc = client.get_service::<dyn Calculator>().unwrap();
    let mut a = 4;
    calc.update_argument(&mut a).unwrap();
    assert_eq!(a, 6);
    server.shutdown();
}

#[test]
fn construction_yields_distinct_instances() {
    let (server, client) = pair("construct");

    let mut args = CallBuilder::new();
    args.push("alpha".to_owned());
    let a = client
        .create_instance::<dyn Calculator>("CalculatorImpl", args)
        .unwrap();
    let b = client
        .create_instance::<dyn Calculator>("CalculatorImpl", CallBuilder::new())
        .unwrap();

    assert_eq!(a.process_tag().unwrap(), "alpha");
    assert_eq!(b.process_tag().unwrap(), "constructed");

    let a_obj: Arc<dyn Remotable> = a.clone();
    let b_obj: Arc<dyn Remotable> = b.clone();
    assert_ne!(
        client.instances().try_get_id(&a_obj).unwrap(),
        client.instances().try_get_id(&b_obj).unwrap()
    );
    server.shutdown();
}

#[test]
fn callback_crosses_the_reverse_channel() {
    let (server, client) = pair("callback");
    let calc = client.get_service::<dyn Calculator>().unwrap();

    let cb = Arc::new(CallbackImpl {
        hits: Mutex::new(Vec::new()),
    });
    calc.register_callback(cb.clone()).unwrap();
    calc.do_callback().unwrap();

    assert_eq!(&*cb.hits.lock().unwrap(), &["ping".to_owned()]);
    server.shutdown();
}

#[test]
fn events_add_fire_remove() {
    let (server, client) = pair("events");
    let calc = client.get_service::<dyn Calculator>().unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let h = {
        let count = Arc::clone(&count);
        let seen = Arc::clone(&seen);
        Delegate::from_fn(move |msg: String| {
            count.fetch_add(1, Ordering::SeqCst);
            seen.lock().unwrap().push(msg);
        })
    };

    calc.add_an_event(h.clone()).unwrap();
    calc.fire_event("x".to_owned()).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(&*seen.lock().unwrap(), &["x".to_owned()]);

    calc.remove_an_event(h.clone()).unwrap();
    // A second remove of the same handler must be a harmless no-op.
    calc.remove_an_event(h.clone()).unwrap();
    calc.fire_event("y".to_owned()).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    server.shutdown();
}

#[test]
fn unserializable_argument_fails_at_the_caller() {
    let (server, client) = pair("unserializable");
    let calc = client.get_service::<dyn Calculator>().unwrap();
    let err = calc.describe(Opaque).unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));
    // The connection survives: the failure happened before anything was
    // sent.
    assert_eq!(calc.process_tag().unwrap(), "service");
    server.shutdown();
}

#[test]
fn remote_failure_is_rethrown_at_the_caller() {
    let (server, client) = pair("fault");
    let calc = client.get_service::<dyn Calculator>().unwrap();
    let err = calc.fail_with("nope".to_owned()).unwrap_err();
    match err {
        Error::Remote(fault) => assert!(fault.to_string().contains("nope")),
        other => panic!("expected a remote fault, got {other:?}"),
    }
    server.shutdown();
}

#[test]
fn dropped_proxies_are_reclaimed_by_sweep() {
    let (server, client) = pair("gc");
    let calc = client.get_service::<dyn Calculator>().unwrap();

    let component = calc.get_component().unwrap();
    assert_eq!(component.name().unwrap(), "component");
    let id = {
        let as_obj: Arc<dyn Remotable> = component.clone();
        client.instances().try_get_id(&as_obj).unwrap()
    };
    assert!(server.instances().try_get(&id).is_some());

    // Nothing to reclaim while the proxy is alive.
    assert_eq!(client.sweep().unwrap(), 0);

    drop(component);
    assert_eq!(client.sweep().unwrap(), 1);

    // The cleanup frame is one-way; give the server a moment to apply it.
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.instances().try_get(&id).is_some() {
        assert!(Instant::now() < deadline, "server never released {id}");
        std::thread::sleep(Duration::from_millis(10));
    }

    // Reclamation must not break anything: a fresh fetch still works.
    let again = calc.get_component().unwrap();
    assert_eq!(again.name().unwrap(), "component");
    server.shutdown();
}

#[test]
fn server_shutdown_fails_pending_work() {
    let (server, client) = pair("shutdown");
    let calc = client.get_service::<dyn Calculator>().unwrap();
    assert_eq!(calc.process_tag().unwrap(), "service");

    client.shutdown_server().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !server.is_shut_down() {
        assert!(Instant::now() < deadline, "server never observed shutdown");
        std::thread::sleep(Duration::from_millis(10));
    }
    server.shutdown();

    // Calls after the teardown fail cleanly rather than hanging.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match calc.process_tag() {
            Err(_) => break,
            Ok(_) => {
                assert!(Instant::now() < deadline, "connection never tore down");
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}
