use spigot::{http, ws, Reactor, Response, Scheduler};
use std::{cell::RefCell, rc::Rc};

fn main() {
    env_logger::init();

    let sched = Rc::new(RefCell::new(Scheduler::new()));
    let mut reactor = Reactor::default();

    let route_sched = sched.clone();
    let addr = reactor
        .listen(
            "127.0.0.1:8080",
            http::make_server(move |conn| {
                if conn.url() == "/echo" {
                    let sched = route_sched.clone();
                    if let Some(r) = ws::upgrade(conn, 65536, move |socket, msg| {
                        let mut reply = b"Immediate echo: ".to_vec();
                        reply.extend_from_slice(&msg);
                        let ok = socket.borrow().send_text(reply);

                        // a parked handle plus the scheduler stands in for
                        // updates arriving from elsewhere in the system;
                        // the send fails quietly if the peer left already
                        let parked = socket.clone();
                        let mut delayed = b"Delayed echo: ".to_vec();
                        delayed.extend_from_slice(&msg);
                        sched.borrow_mut().timeout(1000, move || {
                            let _ = parked.borrow().send_text(&delayed);
                        });

                        ok
                    }) {
                        return Some(r.into());
                    }
                }

                if conn.url() == "/hello" {
                    return Some(Response::text(200, "Hello world!").into());
                }
                None
            }),
        )
        .expect("listen failed");

    println!("websocket echo on ws://{addr}/echo");
    reactor.run_with(move || sched.borrow_mut().poll());
}
