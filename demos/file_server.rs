use spigot::{http, Reactor};

fn main() {
    env_logger::init();

    let mut reactor = Reactor::default();
    let addr = reactor
        .listen(
            "127.0.0.1:8080",
            http::make_server(|conn| {
                if conn.url() == "/" {
                    conn.set_url("/index.html");
                }
                http::match_file_response(conn, "/", "public_html/").map(Into::into)
            }),
        )
        .expect("listen failed");

    println!("serving ./public_html on http://{addr}");
    reactor.run();
}
