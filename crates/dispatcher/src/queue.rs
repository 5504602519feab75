use linkmux_core::TaskProfile;

/// Tasks ordered by priority, first-in first-out within one priority.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Vec<TaskProfile>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, profile: TaskProfile) {
        let priority = profile.task.priority;
        let pos = self
            .tasks
            .iter()
            .position(|p| p.task.priority > priority)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(pos, profile);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, task_id: u32) -> bool {
        self.tasks.iter().any(|p| p.task.task_id == task_id)
    }

    pub fn get(&self, task_id: u32) -> Option<&TaskProfile> {
        self.tasks.iter().find(|p| p.task.task_id == task_id)
    }

    pub fn get_mut(&mut self, task_id: u32) -> Option<&mut TaskProfile> {
        self.tasks.iter_mut().find(|p| p.task.task_id == task_id)
    }

    /// The task running on `running_id`.
    pub fn find_running(&mut self, running_id: u64) -> Option<&mut TaskProfile> {
        if running_id == 0 {
            return None;
        }
        self.tasks.iter_mut().find(|p| p.running_id == running_id)
    }

    pub fn remove(&mut self, task_id: u32) -> Option<TaskProfile> {
        let pos = self.tasks.iter().position(|p| p.task.task_id == task_id)?;
        Some(self.tasks.remove(pos))
    }

    /// Ids in scheduling order.
    pub fn ids(&self) -> Vec<u32> {
        self.tasks.iter().map(|p| p.task.task_id).collect()
    }

    pub fn running_ids(&self) -> Vec<u32> {
        self.tasks
            .iter()
            .filter(|p| p.is_running())
            .map(|p| p.task.task_id)
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.tasks.iter().filter(|p| p.is_running()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskProfile> {
        self.tasks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TaskProfile> {
        self.tasks.iter_mut()
    }

    pub fn drain(&mut self) -> Vec<TaskProfile> {
        std::mem::take(&mut self.tasks)
    }
}
