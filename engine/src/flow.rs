//! Flow contexts and the per-worker flow table.
//!
//! A `FlowContext` is the only owner of the analyzer bound to a flow. Tearing the context
//! down closes the analyzer and drops it; nothing else holds on to it.

use std::num::NonZeroUsize;

use lru::LruCache;
use nt_analyzer::{
    extract_pairs_from_combinedpropmap, Analyzer, AnalyzerTag, CombinedPropMap, FlowInfo,
    PropUpdate, PropUpdateType,
};
use tracing::{debug, info};

const DEFAULT_MAX_FLOWS: NonZeroUsize = match NonZeroUsize::new(4096) {
    Some(n) => n,
    None => unreachable!(),
};

/// The outcome of dispatch for a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Dispatch has not decided yet.
    Pending,
    /// An analyzer has been bound. The flow is never re-selected.
    Bound(AnalyzerTag),
    /// No analyzer applies, or its factory failed. The flow passes through unanalyzed.
    Unanalyzed,
}

/// The analyzer bound to a flow along with its remaining byte quota.
struct ActiveAnalyzer {
    analyzer: Box<dyn Analyzer>,
    has_limit: bool,
    quota: u32,
}

/// The runtime record of one observed flow.
pub struct FlowContext {
    info: FlowInfo,

    /// Analyzer explicitly requested by the analyzer tree.
    requested: Option<String>,

    binding: Binding,

    /// `None` once the analyzer is done, or when nothing is bound.
    active: Option<ActiveAnalyzer>,

    /// Payload seen while dispatch is pending, for signature matching.
    prefix: Vec<u8>,

    /// Properties reported by the bound analyzer.
    props: CombinedPropMap,
}

impl FlowContext {
    pub fn new(info: FlowInfo, requested: Option<String>) -> Self {
        Self {
            info,
            requested,
            binding: Binding::Pending,
            active: None,
            prefix: Vec::new(),
            props: CombinedPropMap::new(),
        }
    }

    pub fn info(&self) -> &FlowInfo {
        &self.info
    }

    pub fn requested(&self) -> Option<&str> {
        self.requested.as_deref()
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    /// True while an analyzer is bound and still wants data.
    pub fn is_analyzing(&self) -> bool {
        self.active.is_some()
    }

    pub fn props(&self) -> &CombinedPropMap {
        &self.props
    }

    /// The payload buffered for signature matching.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Append payload to the prefix, keeping at most `max_len` bytes.
    pub(crate) fn extend_prefix(&mut self, payload: &[u8], max_len: usize) {
        let room = max_len.saturating_sub(self.prefix.len());
        self.prefix
            .extend_from_slice(&payload[..room.min(payload.len())]);
    }

    pub(crate) fn bind(&mut self, tag: AnalyzerTag, analyzer: Box<dyn Analyzer>) {
        let limit = analyzer.limit();
        self.active = Some(ActiveAnalyzer {
            analyzer,
            has_limit: limit > 0,
            quota: limit,
        });
        self.binding = Binding::Bound(tag);
        self.prefix = Vec::new();
    }

    pub(crate) fn mark_unanalyzed(&mut self) {
        self.binding = Binding::Unanalyzed;
        self.prefix = Vec::new();
    }

    /// Record a property update under the bound analyzer's name.
    ///
    /// # Returns
    ///
    /// * `bool` - true if the properties changed.
    fn apply(&mut self, update: Option<PropUpdate>) -> bool {
        let (Binding::Bound(tag), Some(update)) = (&self.binding, update) else {
            return false;
        };

        let name = tag.name();
        match update.update_type {
            PropUpdateType::None => return false,
            PropUpdateType::Merge => self
                .props
                .entry(name.to_string())
                .or_default()
                .extend(update.map),
            PropUpdateType::Replace => {
                self.props.insert(name.to_string(), update.map);
            }
            PropUpdateType::Delete => {
                self.props.remove(name);
            }
        }
        true
    }

    /// Feed a payload to the bound analyzer.
    ///
    /// # Returns
    ///
    /// * `bool` - true if the flow's properties changed.
    pub fn feed(&mut self, rev: bool, data: &[u8]) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };

        let (update, close_update, done) = if !active.has_limit {
            let (update, done) = active.analyzer.feed(rev, data);
            let close_update = if done {
                active.analyzer.close(false)
            } else {
                None
            };
            (update, close_update, done)
        } else {
            let data = if data.len() > active.quota as usize {
                &data[..active.quota as usize]
            } else {
                data
            };

            let (update, done) = active.analyzer.feed(rev, data);
            active.quota -= data.len() as u32;

            if active.quota == 0 {
                (update, active.analyzer.close(true), true)
            } else if done {
                (update, active.analyzer.close(false), true)
            } else {
                (update, None, false)
            }
        };

        if done {
            // Closed above; dropping it here releases it exactly once.
            self.active = None;
            debug!("Analyzer done with flow {}", self.info);
        }

        let up1 = self.apply(update);
        let up2 = self.apply(close_update);
        up1 || up2
    }

    /// Tear the flow down: close the analyzer if it is still active, drop it and report
    /// what it found.
    pub fn teardown(mut self) {
        if let Some(mut active) = self.active.take() {
            let update = active.analyzer.close(false);
            drop(active);
            self.apply(update);
        }

        match &self.binding {
            Binding::Bound(tag) => info!(
                "Flow {} analyzed by {}: {:?}",
                self.info,
                tag,
                extract_pairs_from_combinedpropmap(&self.props)
            ),
            binding => debug!("Flow {} torn down: {:?}", self.info, binding),
        }
    }
}

/// Bounded table of the flows a worker owns, keyed by stream id.
///
/// The least recently used flow is torn down when the table is full.
pub struct FlowTable {
    flows: LruCache<u32, FlowContext>,
}

impl FlowTable {
    /// Creates a table holding at most `max_flows` flows; zero means the default.
    pub fn new(max_flows: usize) -> Self {
        Self {
            flows: LruCache::new(NonZeroUsize::new(max_flows).unwrap_or(DEFAULT_MAX_FLOWS)),
        }
    }

    /// Finds the context of a packet, creating it with `create` when the stream id is new
    /// or now carries a different flow.
    ///
    /// # Returns
    ///
    /// The context, and whether the packet travels in the reverse direction.
    pub fn get_or_create<F>(
        &mut self,
        stream_id: u32,
        packet: &crate::packet::DecodedPacket,
        create: F,
    ) -> (&mut FlowContext, bool)
    where
        F: FnOnce() -> FlowContext,
    {
        let found = self.flows.get(&stream_id).map(|ctx| {
            ctx.info()
                .matches(packet.src_ip, packet.dst_ip, packet.src_port, packet.dst_port)
        });

        let reverse = match found {
            Some((true, reverse)) => reverse,
            Some((false, _)) => {
                // Same stream id, different flow.
                if let Some(old) = self.flows.pop(&stream_id) {
                    old.teardown();
                }
                self.insert(stream_id, create());
                false
            }
            None => {
                self.insert(stream_id, create());
                false
            }
        };

        let ctx = self
            .flows
            .get_mut(&stream_id)
            .expect("the flow was looked up or inserted above");
        (ctx, reverse)
    }

    fn insert(&mut self, stream_id: u32, ctx: FlowContext) {
        if let Some((_, evicted)) = self.flows.push(stream_id, ctx) {
            debug!("Evicting flow {}", evicted.info());
            evicted.teardown();
        }
    }

    /// Tear down a single flow.
    ///
    /// # Returns
    ///
    /// * `bool` - false if no flow had that stream id.
    pub fn remove(&mut self, stream_id: u32) -> bool {
        match self.flows.pop(&stream_id) {
            Some(ctx) => {
                ctx.teardown();
                true
            }
            None => false,
        }
    }

    /// Tear down every flow.
    pub fn clear(&mut self) {
        while let Some((_, ctx)) = self.flows.pop_lru() {
            ctx.teardown();
        }
    }

    pub fn get(&self, stream_id: u32) -> Option<&FlowContext> {
        self.flows.peek(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::DecodedPacket;
    use nt_analyzer::{PropMap, PropUpdateType, Transport};
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    /// Counts closes and drops so that release can be checked.
    #[derive(Debug)]
    struct Tracked {
        limit: u32,
        done_after: Option<usize>,
        fed: usize,
        closes: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
        limited_close: Arc<AtomicUsize>,
    }

    impl Analyzer for Tracked {
        fn name(&self) -> &str {
            "tracked"
        }

        fn limit(&self) -> u32 {
            self.limit
        }

        fn feed(&mut self, _rev: bool, data: &[u8]) -> (Option<PropUpdate>, bool) {
            self.fed += data.len();
            let mut map = PropMap::new();
            map.insert("fed".to_string(), Arc::new(self.fed as u64));
            let done = self.done_after.is_some_and(|n| self.fed >= n);
            (
                Some(PropUpdate {
                    update_type: PropUpdateType::Merge,
                    map,
                }),
                done,
            )
        }

        fn close(&mut self, limited: bool) -> Option<PropUpdate> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if limited {
                self.limited_close.fetch_add(1, Ordering::SeqCst);
            }
            None
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Counters {
        closes: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
        limited: Arc<AtomicUsize>,
    }

    fn tracked(limit: u32, done_after: Option<usize>) -> (Box<dyn Analyzer>, Counters) {
        let counters = Counters {
            closes: Arc::new(AtomicUsize::new(0)),
            drops: Arc::new(AtomicUsize::new(0)),
            limited: Arc::new(AtomicUsize::new(0)),
        };
        let tracked = Tracked {
            limit,
            done_after,
            fed: 0,
            closes: counters.closes.clone(),
            drops: counters.drops.clone(),
            limited_close: counters.limited.clone(),
        };
        (Box::new(tracked), counters)
    }

    fn info(src_port: u16) -> FlowInfo {
        FlowInfo {
            uid: src_port as i64,
            transport: Transport::UDP,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port,
            dst_port: 53,
        }
    }

    fn packet(src_port: u16) -> DecodedPacket {
        DecodedPacket {
            transport: Transport::UDP,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port,
            dst_port: 53,
            payload: Vec::new(),
        }
    }

    fn fed(ctx: &FlowContext) -> u64 {
        *ctx.props()["tracked"]["fed"].downcast_ref::<u64>().unwrap()
    }

    #[test]
    fn test_teardown_releases_once() {
        let (analyzer, counters) = tracked(0, None);
        let mut ctx = FlowContext::new(info(1000), None);
        ctx.bind(AnalyzerTag::new("tracked"), analyzer);

        assert!(ctx.feed(false, b"abc"));
        assert_eq!(fed(&ctx), 3);

        ctx.teardown();
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_quota_closes_limited() {
        let (analyzer, counters) = tracked(4, None);
        let mut ctx = FlowContext::new(info(1000), None);
        ctx.bind(AnalyzerTag::new("tracked"), analyzer);

        ctx.feed(false, b"ab");
        assert!(ctx.is_analyzing());
        ctx.feed(true, b"cdef");
        // Only the remaining quota was fed.
        assert_eq!(fed(&ctx), 4);
        assert!(!ctx.is_analyzing());
        assert_eq!(counters.limited.load(Ordering::SeqCst), 1);
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);

        // The binding survives the analyzer.
        assert_eq!(ctx.binding(), &Binding::Bound(AnalyzerTag::new("tracked")));
        assert!(!ctx.feed(false, b"more"));

        ctx.teardown();
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_done_analyzer_is_closed() {
        let (analyzer, counters) = tracked(0, Some(2));
        let mut ctx = FlowContext::new(info(1000), None);
        ctx.bind(AnalyzerTag::new("tracked"), analyzer);

        ctx.feed(false, b"xy");
        assert!(!ctx.is_analyzing());
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.limited.load(Ordering::SeqCst), 0);
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unbound_flow_ignores_data() {
        let mut ctx = FlowContext::new(info(1000), Some("UDP".to_string()));
        assert_eq!(ctx.requested(), Some("UDP"));
        assert!(!ctx.feed(false, b"data"));
        ctx.mark_unanalyzed();
        assert_eq!(ctx.binding(), &Binding::Unanalyzed);
        assert!(ctx.props().is_empty());
        ctx.teardown();
    }

    fn update(update_type: PropUpdateType, pairs: &[(&str, u64)]) -> Option<PropUpdate> {
        let mut map = PropMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), Arc::new(*v));
        }
        Some(PropUpdate { update_type, map })
    }

    fn prop(ctx: &FlowContext, key: &str) -> Option<u64> {
        ctx.props()
            .get("tracked")?
            .get(key)?
            .downcast_ref::<u64>()
            .copied()
    }

    #[test]
    fn test_prop_updates() {
        let mut ctx = FlowContext::new(info(1000), None);
        // Nothing is recorded before an analyzer is bound.
        assert!(!ctx.apply(update(PropUpdateType::Merge, &[("orig", 1)])));
        assert!(ctx.props().is_empty());

        let (analyzer, _counters) = tracked(0, None);
        ctx.bind(AnalyzerTag::new("tracked"), analyzer);
        assert!(!ctx.apply(None));
        assert!(!ctx.apply(update(PropUpdateType::None, &[("orig", 1)])));
        assert!(ctx.props().is_empty());

        assert!(ctx.apply(update(PropUpdateType::Merge, &[("orig", 1)])));
        assert!(ctx.apply(update(PropUpdateType::Merge, &[("resp", 2)])));
        assert_eq!(prop(&ctx, "orig"), Some(1));
        assert_eq!(prop(&ctx, "resp"), Some(2));

        assert!(ctx.apply(update(PropUpdateType::Replace, &[("total", 3)])));
        assert_eq!(prop(&ctx, "orig"), None);
        assert_eq!(prop(&ctx, "total"), Some(3));

        assert!(ctx.apply(update(PropUpdateType::Delete, &[])));
        assert!(!ctx.props().contains_key("tracked"));
    }

    #[test]
    fn test_prefix_is_bounded() {
        let mut ctx = FlowContext::new(info(1000), None);
        ctx.extend_prefix(b"AB", 4);
        ctx.extend_prefix(b"", 4);
        ctx.extend_prefix(b"CDEF", 4);
        assert_eq!(ctx.prefix(), b"ABCD");
        ctx.extend_prefix(b"G", 4);
        assert_eq!(ctx.prefix(), b"ABCD");

        ctx.mark_unanalyzed();
        assert!(ctx.prefix().is_empty());
    }

    #[test]
    fn test_flow_table_reverse_and_reuse() {
        let mut table = FlowTable::new(8);

        let (ctx, reverse) = table.get_or_create(1, &packet(1000), || {
            FlowContext::new(info(1000), None)
        });
        assert!(!reverse);
        assert_eq!(ctx.info().src_port, 1000);

        let mut back = packet(1000);
        back.src_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        back.dst_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        back.src_port = 53;
        back.dst_port = 1000;
        let (_, reverse) = table.get_or_create(1, &back, || unreachable!());
        assert!(reverse);

        // The stream id now carries another flow: the old one is torn down.
        let (analyzer, counters) = tracked(0, None);
        table
            .get_or_create(1, &packet(1000), || unreachable!())
            .0
            .bind(AnalyzerTag::new("tracked"), analyzer);
        let (ctx, _) = table.get_or_create(1, &packet(2000), || {
            FlowContext::new(info(2000), None)
        });
        assert_eq!(ctx.info().src_port, 2000);
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_flow_table_eviction() {
        let mut table = FlowTable::new(2);
        let (analyzer, counters) = tracked(0, None);

        table
            .get_or_create(1, &packet(1), || FlowContext::new(info(1), None))
            .0
            .bind(AnalyzerTag::new("tracked"), analyzer);
        table.get_or_create(2, &packet(2), || FlowContext::new(info(2), None));
        table.get_or_create(3, &packet(3), || FlowContext::new(info(3), None));

        assert_eq!(table.len(), 2);
        assert!(table.get(1).is_none());
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);

        assert!(table.remove(2));
        assert!(!table.remove(2));
        table.clear();
        assert!(table.is_empty());
    }
}
