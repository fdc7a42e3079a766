use crate::model::{NodeInput, NodeOutput, TransactionNode, TransactionTree, UtxoFlow};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// Link flows into chains of transactions where one spends from an address the previous paid to.
///
/// Starting from each transaction not yet part of a chain, address links are followed up to
/// `max_depth` hops backward and `max_depth` hops forward. Chains of a single transaction are
/// dropped. The longest chains come first.
pub fn build_flow_chains(flows: &[UtxoFlow], max_depth: usize) -> Vec<TransactionTree> {
    let mut legs = BTreeMap::<&str, Vec<&UtxoFlow>>::new();
    let mut paid_to = HashMap::<&str, BTreeSet<&str>>::new();
    let mut spent_from = HashMap::<&str, BTreeSet<&str>>::new();

    for flow in flows {
        legs.entry(&flow.txid).or_default().push(flow);
        paid_to.entry(&flow.to_address).or_default().insert(&flow.txid);
        spent_from.entry(&flow.from_address).or_default().insert(&flow.txid);
    }

    // Transactions that paid to one of `txid`'s input addresses.
    let backward = |txid: &str| -> BTreeSet<&str> {
        legs[txid]
            .iter()
            .filter_map(|flow| paid_to.get(flow.from_address.as_str()))
            .flatten()
            .copied()
            .filter(|other| *other != txid)
            .collect()
    };

    // Transactions that spent from one of `txid`'s output addresses.
    let forward = |txid: &str| -> BTreeSet<&str> {
        legs[txid]
            .iter()
            .filter_map(|flow| spent_from.get(flow.to_address.as_str()))
            .flatten()
            .copied()
            .filter(|other| *other != txid)
            .collect()
    };

    let mut processed = HashSet::<&str>::new();
    let mut chains = Vec::new();

    for &start in legs.keys() {
        if processed.contains(start) {
            continue;
        }

        let mut members = walk(start, max_depth, &backward);
        members.extend(walk(start, max_depth, &forward));
        processed.extend(members.iter().copied());

        if members.len() < 2 {
            continue;
        }
        trace!("Chain through `{start}` has {} transactions", members.len());

        let mut nodes = BTreeMap::new();
        for &txid in &members {
            nodes.insert(txid.to_string(), chain_node(txid, &legs[txid]));
        }

        // Link each member to the members spending its outputs. The first link wins.
        for &txid in &members {
            for child in forward(txid) {
                if !members.contains(child) || nodes[child].parent.is_some() {
                    continue;
                }
                if let Some(node) = nodes.get_mut(child) {
                    node.parent = Some(txid.to_string());
                }
                if let Some(node) = nodes.get_mut(txid) {
                    node.children.push(child.to_string());
                }
            }
        }

        let earliest = nodes
            .values()
            .min_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)))
            .map(|node| node.id.clone())
            .unwrap_or_default();

        let length = nodes.len();
        let mut tree = TransactionTree::new(format!("chain_{earliest}"), nodes);
        tree.chain_length = Some(length);
        chains.push(tree);
    }
    debug!("Found {} flow chains", chains.len());

    chains.sort_by(|a, b| b.chain_length.cmp(&a.chain_length));

    chains
}

/// Breadth-first walk from `start` along `links`, at most `max_depth` hops.
fn walk<'a, F>(start: &'a str, max_depth: usize, links: &F) -> BTreeSet<&'a str>
where
    F: Fn(&str) -> BTreeSet<&'a str>,
{
    let mut visited = BTreeSet::from([start]);
    let mut queue = VecDeque::from([(start, 0)]);

    while let Some((txid, depth)) = queue.pop_front() {
        if depth == max_depth {
            continue;
        }
        for next in links(txid) {
            if visited.insert(next) {
                queue.push_back((next, depth + 1));
            }
        }
    }

    visited
}

fn chain_node(txid: &str, legs: &[&UtxoFlow]) -> TransactionNode {
    let wallets = legs
        .iter()
        .flat_map(|flow| [&flow.from_wallet, &flow.to_wallet])
        .flatten()
        .cloned()
        .collect();

    TransactionNode {
        id: txid.to_string(),
        date: legs[0].date,
        confirmed: true,
        wallets,
        inputs: legs
            .iter()
            .map(|flow| NodeInput {
                address: Some(flow.from_address.clone()),
                amount: flow.amount,
            })
            .collect(),
        outputs: legs
            .iter()
            .map(|flow| NodeOutput {
                address: Some(flow.to_address.clone()),
                amount: flow.amount,
                is_change: flow.is_change,
                is_external: flow.to_wallet.is_none(),
            })
            .collect(),
        children: Vec::new(),
        parent: None,
        total_amount: legs.iter().map(|flow| flow.amount).sum(),
        fee: legs[0].fee.unwrap_or_default(),
        price: None,
        price_usd: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FlowType;
    use similar_asserts::assert_eq;
    use tracing_test::traced_test;

    fn hop(txid: &str, day: u32, from: &str, to: &str) -> UtxoFlow {
        UtxoFlow {
            from_wallet: Some("A".to_string()),
            to_wallet: Some("B".to_string()),
            from_address: from.to_string(),
            to_address: to.to_string(),
            amount: 10_000,
            txid: txid.to_string(),
            date: format!("2023-02-{day:02}T00:00:00Z").parse().unwrap(),
            fee: None,
            flow_type: FlowType::External,
            is_change: false,
        }
    }

    #[test]
    #[traced_test]
    fn test_flow_chains() {
        let _ = tracing_log::LogTracer::init();

        let flows = [
            hop("t2", 2, "x1", "x2"),
            hop("t1", 1, "x0", "x1"),
            hop("t3", 3, "x2", "x3"),
            hop("u1", 1, "y0", "y1"),
            hop("u2", 2, "y1", "y2"),
            hop("lonely", 5, "z0", "z1"),
        ];
        let chains = build_flow_chains(&flows, 10);

        let shape: Vec<_> = chains
            .iter()
            .map(|chain| (chain.root_id.as_str(), chain.chain_length))
            .collect();
        assert_eq!(shape, [("chain_t1", Some(3)), ("chain_u1", Some(2))]);

        let chain = &chains[0];
        assert_eq!(chain.nodes["t1"].children, ["t2"]);
        assert_eq!(chain.nodes["t3"].parent.as_deref(), Some("t2"));
        assert!(chain.nodes["t1"].parent.is_none());
        assert_eq!(
            chain.summarize().description,
            "UTXO Chain: 3 transactions showing coin movement between wallets"
        );
    }

    #[test]
    #[traced_test]
    fn test_flow_chain_depth() {
        let _ = tracing_log::LogTracer::init();

        let flows = [
            hop("t1", 1, "x0", "x1"),
            hop("t2", 2, "x1", "x2"),
            hop("t3", 3, "x2", "x3"),
            hop("t4", 4, "x3", "x4"),
        ];

        // From t1 one hop forward reaches only t2. From t3 the walk reaches back into t2 again.
        let chains = build_flow_chains(&flows, 1);
        let shape: Vec<_> = chains
            .iter()
            .map(|chain| (chain.root_id.as_str(), chain.chain_length))
            .collect();
        assert_eq!(shape, [("chain_t2", Some(3)), ("chain_t1", Some(2))]);
    }
}
