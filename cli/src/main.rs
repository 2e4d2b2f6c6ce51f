use std::{thread, time::Duration};

use agentlink::{
    attr, DataCache, DispatchConfig, DispatchQueue, LocatorEvent, PeerDescriptor, Roster,
    RosterConfig, RosterEvent, Task,
};
use hashbrown::HashMap;
use tracing::{error, info};

fn main() {
    tracing_subscriber::fmt::init();

    let queue = match DispatchQueue::new(DispatchConfig::builder().name("tcf-dispatch").build()) {
        Ok(queue) => queue,
        Err(e) => {
            error!("could not start the dispatch queue: {e}");
            return;
        }
    };

    let roster = Roster::new(
        &queue,
        RosterConfig::builder()
            .local_addresses(vec!["192.168.1.20".to_owned()])
            .build(),
    );
    if let Err(e) = roster.add_listener(|_: &Roster, event: &RosterEvent| match event {
        RosterEvent::Added(peer) => info!(peer = %peer.id, name = %peer.name, "added"),
        RosterEvent::Updated { new, .. } => info!(peer = %new.id, "updated"),
        RosterEvent::Removed(peer) => info!(peer = %peer.id, "removed"),
        RosterEvent::Disposed => info!("roster disposed"),
    }) {
        error!("{e}");
        return;
    }
    if let Err(e) = roster.add_static(
        PeerDescriptor::new("lab-board", "Lab board")
            .with_attr(attr::TRANSPORT_NAME, "TCP")
            .with_attr(attr::HOST, "10.0.0.5")
            .with_attr(attr::PORT, "1534"),
    ) {
        error!("{e}");
        return;
    }

    // what a locator service would report over a few seconds
    let script = vec![
        LocatorEvent::Added(tcp_peer("10.0.0.7", "Simulator")),
        LocatorEvent::Added(
            tcp_peer("10.0.0.5", "Board agent").with_attr(attr::AGENT_ID, "agent-5"),
        ),
        LocatorEvent::Added(tcp_peer("127.0.0.1", "Local agent")),
        LocatorEvent::Added(tcp_peer("192.168.1.20", "Local agent")),
        LocatorEvent::Added(PeerDescriptor::new("proxy", "Relay").with_attr(attr::VALUE_ADD, "1")),
        LocatorEvent::Heartbeat("TCP:10.0.0.7:1534".to_owned()),
        LocatorEvent::Changed(tcp_peer("10.0.0.7", "Simulator").with_attr("OSName", "Linux")),
        LocatorEvent::Removed("TCP:192.168.1.20:1534".to_owned()),
    ];
    let r = roster.clone();
    let fed = queue.schedule_and_wait(move || {
        for event in script {
            r.handle(event);
        }
    });
    if let Err(e) = fed {
        error!("{e}");
        return;
    }

    // a remote value answered asynchronously by a "transport" thread
    let contexts: DataCache<Vec<String>> = DataCache::new(&queue, "run-control contexts", |token| {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.done(vec!["P1".to_owned(), "P1.T1".to_owned(), "P1.T2".to_owned()]);
        });
    });
    let c = contexts.clone();
    let task = Task::spawn(&queue, move |ctx| {
        if ctx.validate(&c) {
            ctx.done(c.data().map(|ids| ids.len()).unwrap_or_default());
        }
    });
    match task.get_timeout(Duration::from_secs(5)) {
        Ok(count) => info!(count, "run-control contexts resolved"),
        Err(e) => error!("{e}"),
    }

    match roster.all() {
        Ok(peers) => {
            let by_id: HashMap<_, _> = peers.iter().map(|p| (p.id.as_str(), p)).collect();
            for peer in &peers {
                println!("{:<24} {:<14} {:?}", peer.id, peer.name, peer.agent_id());
            }
            println!(
                "{} peers, local agent known: {}",
                by_id.len(),
                by_id.contains_key("TCP:127.0.0.1:1534")
            );
        }
        Err(e) => error!("{e}"),
    }

    if let Err(e) = roster.dispose() {
        error!("{e}");
    }
    queue.shutdown();
    queue.join();
}

fn tcp_peer(host: &str, name: &str) -> PeerDescriptor {
    PeerDescriptor::new(format!("TCP:{host}:1534"), name)
        .with_attr(attr::TRANSPORT_NAME, "TCP")
        .with_attr(attr::HOST, host)
        .with_attr(attr::PORT, "1534")
}
