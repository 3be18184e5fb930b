/// Exchange and queues declared at startup.
///
/// Every queue is durable and bound to the durable topic exchange with a
/// routing key equal to its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queues: Vec<String>,
}

impl Topology {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queues: Vec::new(),
        }
    }

    /// Adds a queue; blank names and duplicates are ignored.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.add_queue(queue);
        self
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for queue in queues {
            self.add_queue(queue);
        }
        self
    }

    fn add_queue(&mut self, queue: impl Into<String>) {
        let queue = queue.into().trim().to_string();
        if !queue.is_empty() && !self.queues.contains(&queue) {
            self.queues.push(queue);
        }
    }
}
