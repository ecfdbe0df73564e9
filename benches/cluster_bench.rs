use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use ftsched::cluster::{
    ClientLocalListenerElector, ClusterNodeAddress, ClusteredOwnershipRecord, DefaultCluster,
    EntryHashElector, FailOverListener, FailoverElector, MembershipView, ShiftElector,
};
use ftsched::config::ClusterConfig;
use ftsched::error::SchedError;
use ftsched::store::{LocalGroup, ReplicatedStore, StorePath};
use ftsched::transaction::{LocalTransactionManager, Transaction};
use std::sync::Arc;
use tokio::runtime::Runtime;

struct NoopGroup {
    base: StorePath,
}

impl FailOverListener for NoopGroup {
    fn base_path(&self) -> &StorePath {
        &self.base
    }

    fn priority(&self) -> i32 {
        0
    }

    fn fail_over_cluster_member(
        &self,
        _lost: &ClusterNodeAddress,
        _tx: Option<&dyn Transaction>,
    ) -> Result<(), SchedError> {
        Ok(())
    }

    fn won_ownership(
        &self,
        _record: &ClusteredOwnershipRecord,
        _tx: Option<&dyn Transaction>,
    ) -> Result<(), SchedError> {
        Ok(())
    }
}

fn view(size: usize) -> MembershipView {
    (0..size)
        .map(|i| ClusterNodeAddress::new(format!("10.0.0.{}:7800", i)))
        .collect()
}

pub fn election_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("election");
    let members = view(32);

    group.bench_function("shift", |b| {
        let elector = ShiftElector::default();
        b.iter(|| black_box(elector.elect(black_box(&members)).unwrap()))
    });

    group.bench_function("entry_hash", |b| {
        let local = LocalGroup::new();
        let store: Arc<dyn ReplicatedStore> = Arc::new(local.join("10.0.0.0:7800".into()));
        let record = ClusteredOwnershipRecord::new(StorePath::new(["calls", "call-1234"]), store);
        b.iter(|| black_box(EntryHashElector.elect(black_box(&members), &record).unwrap()))
    });

    group.finish();
}

fn takeover_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("takeover_256_records", |b| {
        b.iter_batched(
            || {
                let _guard = rt.enter();
                let group = LocalGroup::new();
                let survivor = Arc::new(group.join("A".into()));
                let lost = group.join("B".into());
                let cluster = DefaultCluster::new(
                    &ClusterConfig::default(),
                    survivor.clone(),
                    survivor,
                    Some(Arc::new(LocalTransactionManager::new())),
                    Arc::new(ShiftElector::default()),
                )
                .unwrap();
                cluster.add_fail_over_listener(Arc::new(NoopGroup {
                    base: StorePath::new(["timers"]),
                }));

                let store: Arc<dyn ReplicatedStore> = Arc::new(lost);
                for i in 0..256 {
                    let record = ClusteredOwnershipRecord::new(
                        StorePath::new(["timers".to_string(), format!("t{}", i)]),
                        store.clone(),
                    );
                    record.create(&"B".into()).unwrap();
                }
                (group, cluster)
            },
            |(group, cluster)| {
                let old_view = group.view();
                let new_view = MembershipView::new(vec!["A".into()]);
                cluster.reconcile(black_box(&old_view), &new_view);
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, election_benchmark, takeover_benchmark);
criterion_main!(benches);
