//! Audio filter graph
//!
//! A graph is described through [`GraphBuilder`]: sources declare the format
//! they are fed with, sinks declare the set of formats they accept, and
//! processing stages sit in between. Stages may be added node by node, as an
//! ordered chain of [`StageSpec`]s, or as text in FFmpeg's filtergraph syntax
//! (`[in]volume=0.5,aresample=44100[out]`); all three feed the same node/link
//! representation.
//!
//! `configure()` validates the topology, predicts the format reaching every
//! sink and appends one conversion stage per sink. The resulting
//! [`ConversionPlan`]s are fixed for the lifetime of the graph.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use ffmpeg_next as ffmpeg;

use crate::error::{map_alloc_error, Result, TranscodeError};
use crate::ffmpeg::helpers;
use crate::ffmpeg::utils::{layout_name, parse_layout, parse_sample_format};
use crate::transcode::negotiate::CodecCapabilities;
use crate::types::{FormatDescriptor, Pull, Push};

/// One processing stage: a filter name, an optional instance name and its
/// option string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub filter: String,
    pub instance: Option<String>,
    pub args: Option<String>,
}

impl StageSpec {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            instance: None,
            args: None,
        }
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = Some(args.into());
        self
    }

    pub fn named(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Parse one `filter[@instance][=args]` segment.
    pub fn parse(segment: &str) -> Result<Self> {
        let segment = segment.trim();
        let (head, args) = match segment.split_once('=') {
            Some((head, args)) => (head.trim(), Some(args.trim().to_string())),
            None => (segment, None),
        };
        let (filter, instance) = match head.split_once('@') {
            Some((filter, instance)) => (filter.trim(), Some(instance.trim().to_string())),
            None => (head, None),
        };
        if filter.is_empty() {
            return Err(TranscodeError::GraphNotConfigurable(format!(
                "empty filter name in '{}'",
                segment
            )));
        }
        Ok(Self {
            filter: filter.to_string(),
            instance,
            args: args.filter(|a| !a.is_empty()),
        })
    }

    /// Parse a comma-separated chain without labels, e.g.
    /// `volume=0.5,aresample=44100`.
    pub fn parse_chain(text: &str) -> Result<Vec<Self>> {
        split_top_level(text, ',')
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .map(Self::parse)
            .collect()
    }
}

impl fmt::Display for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filter)?;
        if let Some(instance) = &self.instance {
            write!(f, "@{}", instance)?;
        }
        if let Some(args) = &self.args {
            write!(f, "={}", args)?;
        }
        Ok(())
    }
}

/// The conversion appended in front of a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionPlan {
    /// Format predicted to arrive at the sink.
    pub input: FormatDescriptor,
    /// Format the sink emits.
    pub output: FormatDescriptor,
    /// Filter chain implementing the conversion.
    pub description: String,
}

impl ConversionPlan {
    fn new(input: FormatDescriptor, output: FormatDescriptor) -> Self {
        let pin = format!(
            "aformat=sample_fmts={}:sample_rates={}:channel_layouts={}",
            output.format.name(),
            output.rate,
            layout_name(output.layout)
        );
        let description = if input.rate != output.rate {
            format!("aresample={},{}", output.rate, pin)
        } else {
            pin
        };
        Self {
            input,
            output,
            description,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.input == self.output
    }
}

#[derive(Debug, Clone)]
enum NodeKind {
    Source {
        format: FormatDescriptor,
        time_base: ffmpeg::Rational,
    },
    Sink {
        accepts: CodecCapabilities,
    },
    Filter(StageSpec),
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Node(String),
    /// A `[label]` from a text description: either a node name or a pad
    /// label joining two chains.
    Label(String),
    /// Unlabeled chain end: the only source, or the only sink.
    Default,
}

#[derive(Debug, Clone)]
struct Edge {
    from: Endpoint,
    to: Endpoint,
}

/// A resolved link. The ranks order a node's input and output pads.
#[derive(Debug, Clone, Copy)]
struct Link {
    from: usize,
    to: usize,
    out_rank: usize,
    in_rank: usize,
}

/// Collects nodes and links, then configures them into a [`FilterGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    auto_id: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_node(&mut self, name: &str, kind: NodeKind) -> Result<&mut Self> {
        if name.is_empty() {
            return Err(TranscodeError::GraphNotConfigurable(
                "node name must not be empty".into(),
            ));
        }
        if self.nodes.iter().any(|n| n.name == name) {
            return Err(TranscodeError::GraphNotConfigurable(format!(
                "duplicate node name '{}'",
                name
            )));
        }
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
        });
        Ok(self)
    }

    /// Declare a source fed with frames in `format`, stamped in `time_base`.
    pub fn add_source(
        &mut self,
        name: &str,
        format: FormatDescriptor,
        time_base: ffmpeg::Rational,
    ) -> Result<&mut Self> {
        self.add_node(name, NodeKind::Source { format, time_base })
    }

    /// Declare a sink emitting one format out of `accepts`.
    pub fn add_sink(&mut self, name: &str, accepts: CodecCapabilities) -> Result<&mut Self> {
        self.add_node(name, NodeKind::Sink { accepts })
    }

    pub fn add_filter(&mut self, name: &str, stage: StageSpec) -> Result<&mut Self> {
        self.add_node(name, NodeKind::Filter(stage))
    }

    /// Connect the next free output of `from` to the next free input of `to`.
    pub fn link(&mut self, from: &str, to: &str) -> Result<&mut Self> {
        self.edges.push(Edge {
            from: Endpoint::Node(from.to_string()),
            to: Endpoint::Node(to.to_string()),
        });
        Ok(self)
    }

    /// Add `stages` as a linear chain from `source` to `sink`. An empty
    /// chain links them directly.
    pub fn chain(&mut self, source: &str, stages: &[StageSpec], sink: &str) -> Result<&mut Self> {
        let mut previous = source.to_string();
        for stage in stages {
            let name = self.stage_name(stage);
            self.add_filter(&name, stage.clone())?;
            self.link(&previous, &name)?;
            previous = name;
        }
        self.link(&previous, sink)
    }

    /// Add a textual description: chains separated by `;`, stages by `,`,
    /// with optional `[label]`s at both ends of a chain. Labels naming a
    /// source or sink refer to it; other labels join chains.
    pub fn parse(&mut self, description: &str) -> Result<&mut Self> {
        for chain in split_top_level(description, ';') {
            let chain = chain.trim();
            if chain.is_empty() {
                continue;
            }
            let (inputs, rest) = take_leading_labels(chain)?;
            let (body, outputs) = take_trailing_labels(rest)?;

            let segments = split_top_level(body, ',');
            if segments.iter().all(|s| s.trim().is_empty()) {
                return Err(TranscodeError::GraphNotConfigurable(format!(
                    "chain '{}' has no filters",
                    chain
                )));
            }

            let mut names = Vec::with_capacity(segments.len());
            for segment in segments {
                let stage = StageSpec::parse(segment)?;
                let name = self.stage_name(&stage);
                self.add_filter(&name, stage)?;
                names.push(name);
            }

            let (first, last) = match (names.first(), names.last()) {
                (Some(first), Some(last)) => (first.clone(), last.clone()),
                _ => continue,
            };
            if inputs.is_empty() {
                self.edges.push(Edge {
                    from: Endpoint::Default,
                    to: Endpoint::Node(first.clone()),
                });
            }
            for label in inputs {
                self.edges.push(Edge {
                    from: Endpoint::Label(label),
                    to: Endpoint::Node(first.clone()),
                });
            }
            for pair in names.windows(2) {
                self.link(&pair[0], &pair[1])?;
            }
            if outputs.is_empty() {
                self.edges.push(Edge {
                    from: Endpoint::Node(last),
                    to: Endpoint::Default,
                });
            } else {
                for label in outputs {
                    self.edges.push(Edge {
                        from: Endpoint::Node(last.clone()),
                        to: Endpoint::Label(label),
                    });
                }
            }
        }
        Ok(self)
    }

    fn stage_name(&mut self, stage: &StageSpec) -> String {
        match &stage.instance {
            Some(instance) => instance.clone(),
            None => {
                self.auto_id += 1;
                format!("{}_{}", stage.filter, self.auto_id)
            }
        }
    }

    /// Validate, negotiate and instantiate the graph.
    pub fn configure(self) -> Result<FilterGraph> {
        let links = self.resolve_links()?;
        let order = self.validate(&links)?;

        for node in &self.nodes {
            if let NodeKind::Filter(stage) = &node.kind {
                if ffmpeg::filter::find(&stage.filter).is_none() {
                    return Err(TranscodeError::FilterNotFound(stage.filter.clone()));
                }
            }
        }

        let plans = self.negotiate(&links, &order);
        let description = self.render(&links, &order, &plans);
        let graph = self.instantiate(&description)?;

        let sources = self
            .nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Source { format, .. } => Some((n.name.clone(), *format)),
                _ => None,
            })
            .collect();
        let sinks = plans
            .into_iter()
            .map(|(name, plan)| SinkState {
                name,
                plan,
                finished: false,
            })
            .collect();

        tracing::debug!(description = %description, "Filter graph configured");

        Ok(FilterGraph {
            graph,
            sources,
            sinks,
            description,
        })
    }

    fn resolve_links(&self) -> Result<Vec<Link>> {
        let index: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.as_str(), i))
            .collect();

        let only = |want_source: bool| -> Result<usize> {
            let matching: Vec<usize> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| match n.kind {
                    NodeKind::Source { .. } => want_source,
                    NodeKind::Sink { .. } => !want_source,
                    NodeKind::Filter(_) => false,
                })
                .map(|(i, _)| i)
                .collect();
            match matching.as_slice() {
                [one] => Ok(*one),
                _ => Err(TranscodeError::GraphNotConfigurable(format!(
                    "unlabeled chain end needs exactly one {}, found {}",
                    if want_source { "source" } else { "sink" },
                    matching.len()
                ))),
            }
        };

        enum Side {
            Resolved(usize),
            Pad(String),
        }
        let resolve = |endpoint: &Endpoint, is_from: bool| -> Result<Side> {
            match endpoint {
                Endpoint::Node(name) => index.get(name.as_str()).map(|i| Side::Resolved(*i)).ok_or_else(
                    || TranscodeError::GraphNotConfigurable(format!("unknown node '{}'", name)),
                ),
                Endpoint::Label(label) => Ok(match index.get(label.as_str()) {
                    Some(i) => Side::Resolved(*i),
                    None => Side::Pad(label.clone()),
                }),
                Endpoint::Default => only(is_from).map(Side::Resolved),
            }
        };

        let mut links = Vec::new();
        // label -> (producer node, rank), (consumer node, rank)
        let mut producers: HashMap<String, Vec<(usize, usize)>> = HashMap::new();
        let mut consumers: HashMap<String, Vec<(usize, usize)>> = HashMap::new();

        for (rank, edge) in self.edges.iter().enumerate() {
            match (resolve(&edge.from, true)?, resolve(&edge.to, false)?) {
                (Side::Resolved(from), Side::Resolved(to)) => links.push(Link {
                    from,
                    to,
                    out_rank: rank,
                    in_rank: rank,
                }),
                (Side::Resolved(from), Side::Pad(label)) => {
                    producers.entry(label).or_default().push((from, rank))
                }
                (Side::Pad(label), Side::Resolved(to)) => {
                    consumers.entry(label).or_default().push((to, rank))
                }
                (Side::Pad(a), Side::Pad(b)) => {
                    return Err(TranscodeError::GraphNotConfigurable(format!(
                        "link between two unresolved labels '{}' and '{}'",
                        a, b
                    )))
                }
            }
        }

        let labels: HashSet<&String> = producers.keys().chain(consumers.keys()).collect();
        for label in labels {
            let produced = producers.get(label).map(Vec::as_slice).unwrap_or(&[]);
            let consumed = consumers.get(label).map(Vec::as_slice).unwrap_or(&[]);
            match (produced, consumed) {
                ([(from, out_rank)], [(to, in_rank)]) => links.push(Link {
                    from: *from,
                    to: *to,
                    out_rank: *out_rank,
                    in_rank: *in_rank,
                }),
                _ => {
                    return Err(TranscodeError::GraphNotConfigurable(format!(
                        "label '{}' is produced {} and consumed {} times",
                        label,
                        produced.len(),
                        consumed.len()
                    )))
                }
            }
        }
        Ok(links)
    }

    /// Check degrees, cycles and reachability. Returns a topological order.
    fn validate(&self, links: &[Link]) -> Result<Vec<usize>> {
        let n = self.nodes.len();
        let mut indegree = vec![0usize; n];
        let mut outdegree = vec![0usize; n];
        for link in links {
            if link.from == link.to {
                return Err(TranscodeError::GraphNotConfigurable(format!(
                    "node '{}' links to itself",
                    self.nodes[link.from].name
                )));
            }
            outdegree[link.from] += 1;
            indegree[link.to] += 1;
        }

        let mut sources = Vec::new();
        let mut sinks = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let ok = match node.kind {
                NodeKind::Source { .. } => {
                    sources.push(i);
                    indegree[i] == 0 && outdegree[i] == 1
                }
                NodeKind::Sink { .. } => {
                    sinks.push(i);
                    indegree[i] == 1 && outdegree[i] == 0
                }
                NodeKind::Filter(_) => indegree[i] >= 1 && outdegree[i] >= 1,
            };
            if !ok {
                return Err(TranscodeError::GraphNotConfigurable(format!(
                    "node '{}' has {} inputs and {} outputs",
                    node.name, indegree[i], outdegree[i]
                )));
            }
        }
        if sources.is_empty() || sinks.is_empty() {
            return Err(TranscodeError::GraphNotConfigurable(format!(
                "graph needs at least one source and one sink ({} sources, {} sinks)",
                sources.len(),
                sinks.len()
            )));
        }

        // Kahn's algorithm; leftover nodes sit on a cycle.
        let mut remaining = indegree.clone();
        let mut queue: VecDeque<usize> = (0..n).filter(|i| remaining[*i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for link in links.iter().filter(|l| l.from == i) {
                remaining[link.to] -= 1;
                if remaining[link.to] == 0 {
                    queue.push_back(link.to);
                }
            }
        }
        if order.len() != n {
            return Err(TranscodeError::GraphNotConfigurable(
                "filter graph contains a cycle".into(),
            ));
        }

        for &source in &sources {
            let mut seen = vec![false; n];
            let mut stack = vec![source];
            while let Some(i) = stack.pop() {
                if std::mem::replace(&mut seen[i], true) {
                    continue;
                }
                stack.extend(links.iter().filter(|l| l.from == i).map(|l| l.to));
            }
            if let Some(&sink) = sinks.iter().find(|s| !seen[**s]) {
                return Err(TranscodeError::GraphNotConfigurable(format!(
                    "no path from source '{}' to sink '{}'",
                    self.nodes[source].name, self.nodes[sink].name
                )));
            }
        }
        Ok(order)
    }

    /// Predict the format reaching every sink and plan its conversion.
    fn negotiate(&self, links: &[Link], order: &[usize]) -> Vec<(String, ConversionPlan)> {
        let mut formats: Vec<Option<FormatDescriptor>> = vec![None; self.nodes.len()];
        let mut plans = Vec::new();
        for &i in order {
            let input = inputs_of(links, i)
                .first()
                .and_then(|l| formats[l.from]);
            let node = &self.nodes[i];
            formats[i] = match &node.kind {
                NodeKind::Source { format, .. } => Some(*format),
                NodeKind::Filter(stage) => input.map(|f| apply_stage(stage, f)),
                NodeKind::Sink { accepts } => {
                    if let Some(input) = input {
                        let output = accepts.resolve(&input);
                        tracing::debug!(
                            sink = %node.name,
                            input = %input,
                            output = %output,
                            "Negotiated sink format"
                        );
                        plans.push((node.name.clone(), ConversionPlan::new(input, output)));
                    }
                    input
                }
            };
        }
        plans
    }

    fn render(&self, links: &[Link], order: &[usize], plans: &[(String, ConversionPlan)]) -> String {
        let label = |link_index: usize| -> String {
            let link = &links[link_index];
            match self.nodes[link.from].kind {
                NodeKind::Source { .. } => self.nodes[link.from].name.clone(),
                _ => format!("link{}", link_index),
            }
        };
        let indices_by = |pick: &dyn Fn(&Link) -> bool, rank: &dyn Fn(&Link) -> usize| {
            let mut found: Vec<usize> = (0..links.len()).filter(|i| pick(&links[*i])).collect();
            found.sort_by_key(|i| rank(&links[*i]));
            found
        };

        let mut statements = Vec::new();
        for &i in order {
            let node = &self.nodes[i];
            let spec = match &node.kind {
                NodeKind::Filter(stage) => StageSpec {
                    instance: Some(node.name.clone()),
                    ..stage.clone()
                },
                _ => continue,
            };
            let mut statement = String::new();
            for l in indices_by(&|l| l.to == i, &|l| l.in_rank) {
                statement.push_str(&format!("[{}]", label(l)));
            }
            statement.push_str(&spec.to_string());
            for l in indices_by(&|l| l.from == i, &|l| l.out_rank) {
                statement.push_str(&format!("[{}]", label(l)));
            }
            statements.push(statement);
        }
        for (sink, plan) in plans {
            let incoming = indices_by(
                &|l| self.nodes[l.to].name == *sink,
                &|l| l.in_rank,
            );
            if let Some(&l) = incoming.first() {
                statements.push(format!("[{}]{}[{}]", label(l), plan.description, sink));
            }
        }
        statements.join(";")
    }

    fn instantiate(&self, description: &str) -> Result<ffmpeg::filter::Graph> {
        let not_configurable =
            |e: ffmpeg::Error| map_alloc_error(e, |e| {
                TranscodeError::GraphNotConfigurable(format!("{} ({})", e, description))
            });

        let abuffer = ffmpeg::filter::find("abuffer")
            .ok_or_else(|| TranscodeError::FilterNotFound("abuffer".into()))?;
        let abuffersink = ffmpeg::filter::find("abuffersink")
            .ok_or_else(|| TranscodeError::FilterNotFound("abuffersink".into()))?;

        let mut graph = ffmpeg::filter::Graph::new();
        let mut sources = Vec::new();
        let mut sinks = Vec::new();
        for node in &self.nodes {
            match &node.kind {
                NodeKind::Source { format, time_base } => {
                    let args = format!(
                        "time_base={}:sample_rate={}:sample_fmt={}:channel_layout={}",
                        time_base,
                        format.rate,
                        format.format.name(),
                        layout_name(format.layout)
                    );
                    graph
                        .add(&abuffer, &node.name, &args)
                        .map_err(not_configurable)?;
                    sources.push(node.name.as_str());
                }
                NodeKind::Sink { .. } => {
                    graph
                        .add(&abuffersink, &node.name, "")
                        .map_err(not_configurable)?;
                    sinks.push(node.name.as_str());
                }
                NodeKind::Filter(_) => {}
            }
        }

        let (first, others) = match sources.split_first() {
            Some(split) => split,
            None => {
                return Err(TranscodeError::GraphNotConfigurable(
                    "graph has no source".into(),
                ))
            }
        };
        let mut parser = graph.output(first, 0).map_err(not_configurable)?;
        for source in others {
            parser = parser.output(source, 0).map_err(not_configurable)?;
        }
        for sink in &sinks {
            parser = parser.input(sink, 0).map_err(not_configurable)?;
        }
        parser.parse(description).map_err(not_configurable)?;
        graph.validate().map_err(not_configurable)?;

        Ok(graph)
    }
}

fn inputs_of(links: &[Link], node: usize) -> Vec<Link> {
    let mut inputs: Vec<Link> = links.iter().filter(|l| l.to == node).copied().collect();
    inputs.sort_by_key(|l| l.in_rank);
    inputs
}

/// Format leaving `stage` when `input` enters it. Filters that do not
/// declare a target format are assumed to preserve it; the conversion
/// pinned in front of every sink covers the rest.
fn apply_stage(stage: &StageSpec, input: FormatDescriptor) -> FormatDescriptor {
    let args = stage.args.as_deref().unwrap_or("");
    let mut output = input;
    match stage.filter.as_str() {
        "aformat" => {
            for (key, value) in options(args, &["sample_fmts", "sample_rates", "channel_layouts"]) {
                let values: Vec<&str> = value.split('|').map(str::trim).collect();
                match key.as_str() {
                    "sample_fmts" | "f" => {
                        let allowed: Vec<_> =
                            values.iter().filter_map(|v| parse_sample_format(v)).collect();
                        if !allowed.contains(&input.format) {
                            if let Some(first) = allowed.first() {
                                output.format = *first;
                            }
                        }
                    }
                    "sample_rates" | "r" => {
                        let allowed: Vec<u32> = values.iter().filter_map(|v| v.parse().ok()).collect();
                        if !allowed.contains(&input.rate) {
                            if let Some(first) = allowed.first() {
                                output.rate = *first;
                            }
                        }
                    }
                    "channel_layouts" | "cl" => {
                        let allowed: Vec<_> = values.iter().filter_map(|v| parse_layout(v)).collect();
                        if !allowed.contains(&input.layout) {
                            if let Some(first) = allowed.first() {
                                output.layout = *first;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        "aresample" => {
            for (key, value) in options(args, &["osr"]) {
                match key.as_str() {
                    "osr" | "out_sample_rate" => {
                        if let Ok(rate) = value.trim().parse() {
                            output.rate = rate;
                        }
                    }
                    "osf" | "out_sample_fmt" => {
                        if let Some(format) = parse_sample_format(&value) {
                            output.format = format;
                        }
                    }
                    "ochl" | "out_chlayout" | "out_channel_layout" => {
                        if let Some(layout) = parse_layout(&value) {
                            output.layout = layout;
                        }
                    }
                    _ => {}
                }
            }
        }
        "pan" => {
            let target = args.split('|').next().unwrap_or("");
            if let Some(layout) = parse_layout(target) {
                output.layout = layout;
            }
        }
        _ => {}
    }
    output
}

/// Split `a=1:b=2` style options; bare values take the positional names.
fn options(args: &str, positional: &[&str]) -> Vec<(String, String)> {
    let mut position = 0;
    split_top_level(args, ':')
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .filter_map(|option| match option.split_once('=') {
            Some((key, value)) => Some((key.trim().to_string(), value.trim().to_string())),
            None => {
                let key = positional.get(position)?;
                position += 1;
                Some((key.to_string(), option.trim().to_string()))
            }
        })
        .collect()
}

/// Split on `sep` outside of `[...]` labels and `'...'` quotes.
fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '[' if !quoted => depth += 1,
            ']' if !quoted => depth = depth.saturating_sub(1),
            c if c == sep && !quoted && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn take_leading_labels(chain: &str) -> Result<(Vec<String>, &str)> {
    let mut labels = Vec::new();
    let mut rest = chain.trim_start();
    while let Some(inner) = rest.strip_prefix('[') {
        let end = inner.find(']').ok_or_else(|| {
            TranscodeError::GraphNotConfigurable(format!("unterminated label in '{}'", chain))
        })?;
        labels.push(inner[..end].trim().to_string());
        rest = inner[end + 1..].trim_start();
    }
    Ok((labels, rest))
}

fn take_trailing_labels(chain: &str) -> Result<(&str, Vec<String>)> {
    let mut labels = Vec::new();
    let mut rest = chain.trim_end();
    while let Some(inner) = rest.strip_suffix(']') {
        let start = inner.rfind('[').ok_or_else(|| {
            TranscodeError::GraphNotConfigurable(format!("unterminated label in '{}'", chain))
        })?;
        labels.push(inner[start + 1..].trim().to_string());
        rest = inner[..start].trim_end();
    }
    labels.reverse();
    Ok((rest, labels))
}

struct SinkState {
    name: String,
    plan: ConversionPlan,
    finished: bool,
}

/// A configured graph. Frames go in at sources and come out at sinks.
pub struct FilterGraph {
    graph: ffmpeg::filter::Graph,
    sources: Vec<(String, FormatDescriptor)>,
    sinks: Vec<SinkState>,
    description: String,
}

impl FilterGraph {
    /// Submit a frame to `source`, or end of stream when `None`.
    pub fn push_frame(
        &mut self,
        source: &str,
        frame: Option<&ffmpeg::util::frame::Audio>,
    ) -> Result<Push> {
        let declared = self
            .sources
            .iter()
            .find(|(name, _)| name == source)
            .map(|(_, format)| *format)
            .ok_or_else(|| TranscodeError::InvalidInput(format!("unknown source '{}'", source)))?;

        if let Some(frame) = frame {
            let actual = FormatDescriptor::of_frame(frame);
            if !actual.same_shape(&declared) {
                return Err(TranscodeError::InvalidInput(format!(
                    "frame format {} does not match source '{}' format {}",
                    actual, source, declared
                )));
            }
        }

        let mut ctx = self
            .graph
            .get(source)
            .ok_or_else(|| TranscodeError::InvalidInput(format!("unknown source '{}'", source)))?;
        match helpers::buffersrc_add_frame(&mut ctx, frame) {
            Ok(()) => Ok(Push::Accepted),
            Err(ffmpeg::Error::Eof) => Ok(Push::Closed),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(Push::Full),
            Err(e) => Err(map_alloc_error(e, |e| {
                TranscodeError::Codec(format!("filter source '{}' rejected frame: {}", source, e))
            })),
        }
    }

    /// Take the next frame from `sink`.
    pub fn pull_frame(&mut self, sink: &str) -> Result<Pull<ffmpeg::util::frame::Audio>> {
        let state = self
            .sinks
            .iter_mut()
            .find(|s| s.name == sink)
            .ok_or_else(|| TranscodeError::InvalidInput(format!("unknown sink '{}'", sink)))?;
        if state.finished {
            return Ok(Pull::EndOfStream);
        }

        let mut ctx = self
            .graph
            .get(sink)
            .ok_or_else(|| TranscodeError::InvalidInput(format!("unknown sink '{}'", sink)))?;
        let mut frame = ffmpeg::util::frame::Audio::empty();
        match ctx.sink().frame(&mut frame) {
            Ok(()) => {
                helpers::normalize_frame_layout(&mut frame);
                Ok(Pull::Ready(frame))
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                Ok(Pull::NeedMoreInput)
            }
            Err(ffmpeg::Error::Eof) => {
                state.finished = true;
                Ok(Pull::EndOfStream)
            }
            Err(e) => Err(map_alloc_error(e, |e| {
                TranscodeError::Codec(format!("filter sink '{}' failed: {}", sink, e))
            })),
        }
    }

    fn sink_state(&self, sink: &str) -> Option<&SinkState> {
        self.sinks.iter().find(|s| s.name == sink)
    }

    /// The format `sink` emits.
    pub fn output_format(&self, sink: &str) -> Option<FormatDescriptor> {
        self.sink_state(sink).map(|s| s.plan.output)
    }

    pub fn conversion(&self, sink: &str) -> Option<&ConversionPlan> {
        self.sink_state(sink).map(|s| &s.plan)
    }

    /// Time base of the frames `sink` emits.
    pub fn sink_time_base(&mut self, sink: &str) -> Option<ffmpeg::Rational> {
        self.sink_state(sink)?;
        let ctx = self.graph.get(sink)?;
        Some(helpers::buffersink_time_base(&ctx))
    }

    /// The filtergraph text handed to FFmpeg.
    pub fn description(&self) -> &str {
        &self.description
    }
}
