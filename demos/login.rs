//! Guest and client views, swapped by a login flag.
//!
//! The client view is "downloaded" on first use and runs a heartbeat task
//! for as long as it is active.

use std::{sync::Arc, time::Duration};
use swapview::{prelude::*, source, BoxError};
use tokio::{sync::watch, time};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::FmtSubscriber;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum View {
    Guest,
    LoggedIn,
}

trait Page: Unit {
    fn render(&self) -> String;
}

struct GuestPage;

impl Unit for GuestPage {}

impl Page for GuestPage {
    fn render(&self) -> String {
        "Welcome, guest! [Log in]".to_owned()
    }
}

struct ClientPage {
    user: String,
}

impl Unit for ClientPage {
    fn deactivate(&mut self) {
        info!("Goodbye, {}", self.user);
    }
}

impl Page for ClientPage {
    fn render(&self) -> String {
        format!("Hello, {}! [Log out]", self.user)
    }
}

struct Screen;

impl PresentationSink<View, Box<dyn Page>> for Screen {
    fn present(&mut self, key: &View, unit: &Box<dyn Page>) {
        info!("[{key:?}] {}", unit.render());
    }

    fn clear(&mut self) {
        info!("[screen cleared]");
    }
}

/// Login state shared with the "button".
struct Session {
    is_logged_in: watch::Sender<bool>,
}

impl Session {
    fn toggle(&self) {
        self.is_logged_in.send_modify(|is_logged_in| {
            *is_logged_in = !*is_logged_in;
            info!("Click: logged in = {is_logged_in}");
        });
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(LevelFilter::TRACE)
            .finish(),
    )?;

    let registry: Arc<Registry<View, Box<dyn Page>>> = Arc::new(Registry::new());
    registry.register(
        View::Guest,
        factory::ready(|_| Ok(Box::new(GuestPage) as Box<dyn Page>)),
    );
    registry.register(
        View::LoggedIn,
        factory::lazy(|| async {
            info!("Loading client view...");
            time::sleep(Duration::from_millis(200)).await;

            Ok::<_, BoxError>(|scope: &mut Scope| {
                let heartbeat = tokio::spawn(async {
                    let mut interval = time::interval(Duration::from_millis(100));
                    loop {
                        interval.tick().await;
                        info!("heartbeat");
                    }
                });
                scope.use_drop(move || heartbeat.abort());

                Ok::<_, BoxError>(Box::new(ClientPage {
                    user: "ferris".to_owned(),
                }) as Box<dyn Page>)
            })
        }),
    );

    let controller = Arc::new(
        Controller::builder(registry, |is_logged_in: &bool| {
            if *is_logged_in {
                View::LoggedIn
            } else {
                View::Guest
            }
        })
        .sink(Screen)
        .build(),
    );

    let (tx, rx) = watch::channel(false);
    let session = Session { is_logged_in: tx };

    let subscription = controller.subscribe(&tokio::runtime::Handle::current(), source::watch(rx));
    time::sleep(Duration::from_millis(50)).await;

    // Log in, then out again before the client view finishes loading.
    session.toggle();
    time::sleep(Duration::from_millis(50)).await;
    session.toggle();
    time::sleep(Duration::from_millis(300)).await;

    // Log in and stay a while.
    session.toggle();
    time::sleep(Duration::from_millis(500)).await;

    session.toggle();
    time::sleep(Duration::from_millis(100)).await;

    subscription.unsubscribe();
    controller.shutdown();

    Ok(())
}
