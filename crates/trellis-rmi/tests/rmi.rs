use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use trellis::{Client, Config, Connection, Registry, Server};
use trellis_rmi::{
    Invocable, InvokeFault, ObjectSpace, RemoteObject, RmiError, decode_args, encode_return,
    register_messages,
};

const ADD: u8 = 0;
const SLOW_ADD: u8 = 1;
const FAIL: u8 = 2;
const BUMP: u8 = 3;

const CALCULATOR: u32 = 42;

struct Calculator {
    bumps: AtomicU32,
}

impl Calculator {
    fn new() -> Arc<Self> {
        Arc::new(Self { bumps: AtomicU32::new(0) })
    }
}

impl Invocable for Calculator {
    fn invoke(&self, method: u8, args: &[u8]) -> Result<Vec<u8>, InvokeFault> {
        match method {
            ADD => {
                let (a, b): (i32, i32) = decode_args(args)?;
                encode_return(&(a + b))
            }
            SLOW_ADD => {
                thread::sleep(Duration::from_millis(2000));
                let (a, b): (i32, i32) = decode_args(args)?;
                encode_return(&(a + b))
            }
            FAIL => Err(InvokeFault::new("boom")),
            BUMP => {
                self.bumps.fetch_add(1, Ordering::SeqCst);
                encode_return(&())
            }
            _ => Err(InvokeFault::new(format!("no method {method}"))),
        }
    }
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    register_messages(&mut registry);
    registry
}

fn spawn_pair(port: u16) -> (Server, Client, Connection, Arc<Calculator>) {
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let server = Server::new(Config::default(), registry()).unwrap();
    server.bind(addr, None).unwrap();
    let calculator = Calculator::new();
    let space = ObjectSpace::new(0);
    space.register(CALCULATOR, calculator.clone());
    server.add_listener(space.listener());
    server.start().unwrap();

    let client = Client::new(Config::default(), registry()).unwrap();
    let conn = client.connect(addr, None, Duration::from_secs(5)).unwrap();
    client.start().unwrap();
    (server, client, conn, calculator)
}

#[test]
fn blocking_call_returns_the_result() {
    let (server, client, conn, _calc) = spawn_pair(54701);
    let proxy = RemoteObject::bind(&conn, 0, CALCULATOR);

    let sum: i32 = proxy.invoke(ADD, &(2, 3)).unwrap();
    assert_eq!(sum, 5);
    // the allocated response id was released on delivery
    assert_eq!(proxy.outstanding_responses(), 0);

    client.stop();
    server.stop();
}

#[test]
fn remote_faults_propagate_per_flag() {
    let (server, client, conn, _calc) = spawn_pair(54703);
    let proxy = RemoteObject::bind(&conn, 0, CALCULATOR);

    let err = proxy.invoke::<_, i32>(FAIL, &()).unwrap_err();
    assert!(matches!(&err, RmiError::Remote(m) if m.contains("boom")), "got {err:?}");

    proxy.set_transmit_exceptions(false);
    let err = proxy.invoke::<_, i32>(FAIL, &()).unwrap_err();
    assert!(
        matches!(&err, RmiError::Remote(m) if m == "remote invocation failed"),
        "got {err:?}"
    );

    client.stop();
    server.stop();
}

#[test]
fn timed_out_call_frees_its_id_for_reuse() {
    let (server, client, conn, _calc) = spawn_pair(54705);
    let proxy = RemoteObject::bind(&conn, 0, CALCULATOR);

    proxy.set_response_timeout(Duration::from_millis(200));
    let err = proxy.invoke::<_, i32>(SLOW_ADD, &(1, 1)).unwrap_err();
    assert!(matches!(err, RmiError::Timeout), "got {err:?}");
    assert_eq!(proxy.outstanding_responses(), 0);

    // let the target finish; its late response must be dropped, and the
    // freed id must serve a new call
    thread::sleep(Duration::from_millis(2200));
    proxy.set_response_timeout(Duration::from_secs(3));
    let sum: i32 = proxy.invoke(ADD, &(2, 3)).unwrap();
    assert_eq!(sum, 5);
    assert_eq!(proxy.outstanding_responses(), 0);

    client.stop();
    server.stop();
}

#[test]
fn deferred_and_oneway_calls() {
    let (server, client, conn, calc) = spawn_pair(54707);
    let proxy = RemoteObject::bind(&conn, 0, CALCULATOR);

    let pending = proxy.invoke_deferred::<_, i32>(ADD, &(20, 22)).unwrap();
    assert!(pending.response_id() != 0);
    assert_eq!(pending.wait().unwrap(), 42);

    proxy.invoke_oneway(BUMP, &()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while calc.bumps.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "one-way call never ran");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(proxy.outstanding_responses(), 0);

    client.stop();
    server.stop();
}

#[test]
fn remembered_deferred_response_can_be_awaited_later() {
    let (server, client, conn, _calc) = spawn_pair(54709);
    let proxy = RemoteObject::bind(&conn, 0, CALCULATOR);
    proxy.set_remember_last_response(true);

    let _first = proxy.invoke_deferred::<_, i32>(ADD, &(3, 4)).unwrap();
    let _last = proxy.invoke_deferred::<_, i32>(ADD, &(5, 6)).unwrap();
    // the proxy tracked the most recent id on its own
    let sum: i32 = proxy.wait_for_last_response().unwrap();
    assert_eq!(sum, 11);

    client.stop();
    server.stop();
}
