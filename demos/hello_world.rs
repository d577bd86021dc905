use spigot::{http, Action, Reactor, Response};

fn main() {
    env_logger::init();

    let mut reactor = Reactor::default();
    let addr = reactor
        .listen(
            "127.0.0.1:8080",
            http::make_server(|conn| {
                if conn.url() == "/hello" {
                    return Some(Response::text(200, "Hello world!").into());
                }

                // stream an upload through a consume function instead of
                // buffering it
                if conn.method() == "POST" && conn.url() == "/upload" {
                    let mut total = 0usize;
                    return Some(Action::consume(move |slice| match slice {
                        Some(view) => {
                            total += view.usage();
                            None
                        }
                        None => Some(Response::text(200, format!("received {total} bytes"))),
                    }));
                }

                Some(Response::text(200, format!("Hello world at {}", conn.url())).into())
            }),
        )
        .expect("listen failed");

    println!("listening on http://{addr}");
    reactor.run();
}
