//! CLI Handler for ftsched
//!
//! Provides command-line functionality for:
//! - Running an in-process failover demo
//! - Printing the effective configuration

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::Duration;
use tracing::info;

use crate::cluster::{ClusterNodeAddress, DefaultCluster, ShiftElector, OWNER_ATTRIBUTE};
use crate::config::Config;
use crate::store::{LocalGroup, ReplicatedStore, StorePath};
use crate::timers::{
    now_millis, task_fn, FaultTolerantScheduler, PeriodicScheduleStrategy, TaskId, TimerTask,
    TimerTaskData, TimerTaskFactory,
};
use crate::transaction::{LocalTransactionManager, TransactionManager};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an in-process cluster, kill one member and show who inherits its timers
    Demo {
        /// Number of simulated members
        #[arg(long, default_value_t = 3)]
        members: usize,
        /// Timers scheduled on the member that gets killed
        #[arg(long, default_value_t = 8)]
        timers: usize,
        /// Address of the member to kill, defaults to the head member
        #[arg(long)]
        kill: Option<String>,
        /// Mirror writes into buddy backups and gravitate them on takeover
        #[arg(long)]
        buddy: bool,
    },
    /// Print the effective configuration as YAML
    Config,
}

struct DemoMember {
    address: ClusterNodeAddress,
    cluster: Arc<DefaultCluster>,
    scheduler: FaultTolerantScheduler,
}

pub struct CliHandler {
    config: Config,
}

impl CliHandler {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn print_config(&self) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(&self.config).context("Failed to render config")?;
        print!("{}", yaml);
        Ok(())
    }

    pub async fn run_demo(
        &self,
        members: usize,
        timers: usize,
        kill: Option<String>,
        buddy: bool,
    ) -> anyhow::Result<()> {
        if members < 2 {
            bail!("A failover demo needs at least 2 members, got {}", members);
        }

        let group = if buddy {
            LocalGroup::with_buddy_replication(self.config.cluster.buddy_backup_root.parse()?)
        } else {
            LocalGroup::new()
        };
        let fired = Arc::new(AtomicUsize::new(0));
        let tm: Arc<dyn TransactionManager> = Arc::new(LocalTransactionManager::new());

        let mut nodes = Vec::with_capacity(members);
        for i in 0..members {
            let address = ClusterNodeAddress::new(format!("127.0.0.1:{}", 7800 + i));
            let member = Arc::new(group.join(address.clone()));
            let cluster = DefaultCluster::new(
                &self.config.cluster,
                member.clone(),
                member,
                Some(tm.clone()),
                Arc::new(ShiftElector::new(self.config.cluster.elector_shift)),
            )?;
            let scheduler = FaultTolerantScheduler::new(
                self.config.scheduler.clone(),
                cluster.clone(),
                counting_factory(fired.clone()),
                None,
                Handle::current(),
            )?;
            nodes.push(DemoMember {
                address,
                cluster,
                scheduler,
            });
        }

        let victim = match kill {
            Some(address) => ClusterNodeAddress::new(address),
            None => group
                .view()
                .head()
                .cloned()
                .context("The simulated view is empty")?,
        };
        let Some(victim_index) = nodes.iter().position(|node| node.address == victim) else {
            bail!("{} is not a member of {}", victim, group.view());
        };

        let victim_node = &nodes[victim_index];
        let tx = tm.begin()?;
        for i in 0..timers {
            let data = TimerTaskData::periodic(
                TaskId::new(format!("demo-{}", i)),
                now_millis() + 200,
                500,
                PeriodicScheduleStrategy::FixedRate,
            )
            .with_payload(serde_json::json!({ "index": i }));
            let task = counting_task(fired.clone());
            victim_node.scheduler.schedule(data, task, Some(tx.as_ref()))?;
        }
        tx.commit()?;
        info!("Scheduled {} timers on {}", timers, victim);

        tokio::time::sleep(Duration::from_millis(800)).await;
        println!("Timer executions before failure: {}", fired.load(Ordering::SeqCst));

        // A crash: local state vanishes, replicated records stay
        victim_node.scheduler.shutdown();
        victim_node.cluster.stop();
        group.leave(&victim);
        println!("Killed {}, view is now {}", victim, group.view());

        let survivors: Vec<&DemoMember> = nodes
            .iter()
            .filter(|node| node.address != victim)
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        for node in &survivors {
            node.cluster.wait_for_reconciliation().await;
        }

        let store = survivors[0].cluster.store().clone();
        let base = survivors[0].scheduler.base_path().clone();
        print_ownership(store.as_ref(), &base, &survivors)?;

        tokio::time::sleep(Duration::from_millis(800)).await;
        println!("Timer executions after takeover: {}", fired.load(Ordering::SeqCst));

        for node in &survivors {
            node.scheduler.shutdown();
            node.cluster.stop();
        }
        Ok(())
    }
}

fn counting_task(fired: Arc<AtomicUsize>) -> Arc<dyn TimerTask> {
    task_fn(move |_, _| {
        fired.fetch_add(1, Ordering::SeqCst);
    })
}

fn counting_factory(fired: Arc<AtomicUsize>) -> Arc<dyn TimerTaskFactory> {
    Arc::new(move |_: &TimerTaskData| Some(counting_task(fired.clone())))
}

fn print_ownership(
    store: &dyn ReplicatedStore,
    base: &StorePath,
    survivors: &[&DemoMember],
) -> anyhow::Result<()> {
    println!("\n{:<12} {:<18} {}", "TASK", "OWNER", "ARMED ON");
    for child in store.children_names(base)? {
        let owner = store
            .get_attribute(&base.child(child.clone()), OWNER_ATTRIBUTE)?
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| "-".to_string());
        let task_id = TaskId::new(child.clone());
        let armed_on: Vec<String> = survivors
            .iter()
            .filter(|node| node.scheduler.is_armed(&task_id))
            .map(|node| node.address.to_string())
            .collect();
        println!("{:<12} {:<18} {}", child, owner, armed_on.join(", "));
    }
    println!();
    Ok(())
}
