//! Content-package layout tracking.
//!
//! While a generic container is read, the element sequence of the first
//! complete content package becomes a template; later packages are
//! compared element by element so a deviation can be reported (and, when
//! configured, the template refreshed at the next package boundary).

use mxfkit_core::GcElementKind;

/// Result of offering one element to the layout tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutEvent {
    /// The element deviates from the template.
    Inconsistent,
    /// Added, somewhere inside the package.
    Added,
    /// Added; the next element should be the last of the package.
    Penultimate,
    /// Added; this was the last element of the package.
    Last,
    /// This element starts a new content package.
    NewPackage,
}

/// Where the tracker currently is within the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutPlace {
    /// No template captured yet.
    Unknown,
    /// Somewhere in the middle.
    Middle,
    /// The next element will be the last.
    Penultimate,
    /// At the end of a package.
    End,
    /// A package just started.
    Start,
}

/// Tracks the element layout of content packages.
#[derive(Debug, Clone)]
pub struct GcLayout {
    /// The captured template.
    template: Vec<GcElementKind>,
    /// The package being accumulated now.
    fresh: Vec<GcElementKind>,
    valid: bool,
    inconsistent: bool,
    /// Replace the template with the fresh layout at each package start.
    auto_refresh: bool,
    /// Complete packages seen since the last reset.
    packages: i64,
}

impl GcLayout {
    /// A tracker that refreshes its template at package boundaries.
    pub fn new(auto_refresh: bool) -> Self {
        GcLayout {
            template: Vec::with_capacity(16),
            fresh: Vec::with_capacity(16),
            valid: false,
            inconsistent: false,
            auto_refresh,
            packages: 0,
        }
    }

    /// Has a template been captured?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Has every offered element matched the template?
    pub fn is_consistent(&self) -> bool {
        !self.inconsistent
    }

    /// Complete packages seen since the last reset.
    pub fn packages(&self) -> i64 {
        self.packages
    }

    /// The most recently offered element.
    pub fn current(&self) -> Option<GcElementKind> {
        self.fresh.last().copied()
    }

    /// Elements per package (template size, or the fresh count before a
    /// template exists).
    pub fn len(&self) -> usize {
        if self.valid {
            self.template.len()
        } else {
            self.fresh.len()
        }
    }

    /// True before any element has been offered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything.
    pub fn reset(&mut self, auto_refresh: bool) {
        self.template.clear();
        self.fresh.clear();
        self.valid = false;
        self.inconsistent = false;
        self.auto_refresh = auto_refresh;
        self.packages = 0;
    }

    fn start_new_package(&mut self, element: GcElementKind) -> LayoutEvent {
        if self.auto_refresh && !self.fresh.is_empty() {
            self.template = std::mem::take(&mut self.fresh);
            self.valid = true;
            self.inconsistent = false;
        }
        self.fresh.clear();
        self.fresh.push(element);
        self.packages += 1;
        LayoutEvent::NewPackage
    }

    /// Offer the next element and report how it fits.
    pub fn offer(&mut self, element: GcElementKind) -> LayoutEvent {
        if !self.valid {
            if self.fresh.is_empty() {
                self.fresh.push(element);
                return LayoutEvent::NewPackage;
            }

            let repeats_single = self.fresh.len() == 1 && element == *self.fresh.last().unwrap();
            let repeats_cycle = self.fresh.len() > 1 && element == self.fresh[0];
            if repeats_single || repeats_cycle {
                return self.start_new_package(element);
            }

            // Within one package the classes run Sys, Pic, Snd, Data, Cpd,
            // except that Pic/Snd/Cpd may follow Data; anything else starts
            // a new package.
            let previous = self.fresh.last().unwrap().class_rank();
            let class = element.class_rank();
            if (class > 0x04 && previous == 0x07) || class >= previous {
                self.fresh.push(element);
                return LayoutEvent::Added;
            }

            return self.start_new_package(element);
        }

        // A template exists: the first template element restarts.
        if !self.template.is_empty() && element == self.template[0] {
            self.fresh.clear();
            self.fresh.push(element);
            self.packages += 1;
            return LayoutEvent::NewPackage;
        }

        self.fresh.push(element);

        if self.fresh.len() > self.template.len() {
            self.inconsistent = true;
            return LayoutEvent::Inconsistent;
        }

        let expected = self.template[self.fresh.len() - 1];
        if element != expected {
            self.inconsistent = true;
            return LayoutEvent::Inconsistent;
        }

        if self.fresh.len() == self.template.len() {
            LayoutEvent::Last
        } else if self.fresh.len() == self.template.len() - 1 {
            LayoutEvent::Penultimate
        } else {
            LayoutEvent::Added
        }
    }

    /// Where the tracker is within the template.
    pub fn place(&self) -> LayoutPlace {
        if !self.valid || self.template.is_empty() {
            return LayoutPlace::Unknown;
        }
        if self.fresh.len() == self.template.len() {
            LayoutPlace::End
        } else if self.fresh.len() == self.template.len() - 1 {
            LayoutPlace::Penultimate
        } else if self.fresh.len() == 1 {
            LayoutPlace::Start
        } else {
            LayoutPlace::Middle
        }
    }

    /// Declare the accumulating layout complete and make it the template.
    pub fn force_end(&mut self) -> bool {
        self.template = std::mem::take(&mut self.fresh);
        self.inconsistent = false;
        self.valid = true;
        self.place() == LayoutPlace::Unknown || !self.template.is_empty()
    }
}

impl Default for GcLayout {
    fn default() -> Self {
        Self::new(true)
    }
}
